//! The legacy-format upgrade pass described in §4.2 "Upgrade path".
//!
//! Old stores may hold `c`-prefixed records: one entry per transaction,
//! packing every output of that transaction plus its height, in the format
//! this layer's predecessor used before switching to one `C`-record per live
//! output. On startup, if any such record is present, this pass converts it
//! to individual `C`-records and erases the legacy record — one transaction
//! at a time, so that an interrupted pass leaves the store in a valid state
//! and simply has fewer legacy records left to convert when it resumes.

use std::io::Cursor;

use chain_types::{BitcoinDeserialize, BitcoinSerialize, Coin, Outpoint, Script, TxHash};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::kvb::{keys, KeyValueBackend, WriteBatch};
use crate::shutdown::{Progress, ShutdownToken};

/// A single transaction's packed legacy coin record: one optional output
/// slot per output index (`None` means already spent or pruned), plus the
/// height and coinbase-ness that applied to every output of that
/// transaction (the legacy format tracked these per-transaction, not
/// per-output, which is exactly why it had to be upgraded: I1 requires one
/// coin key per live outpoint, not one record per transaction).
struct LegacyTxRecord {
    height: u64,
    is_coinbase: bool,
    outputs: Vec<Option<(i64, Script)>>,
}

impl BitcoinDeserialize for LegacyTxRecord {
    fn bitcoin_deserialize<R: std::io::Read>(mut reader: R) -> chain_types::serialization::Result<Self> {
        let height = chain_types::CompactInt::bitcoin_deserialize(&mut reader)?.value();
        let is_coinbase = bool::bitcoin_deserialize(&mut reader)?;
        let count = chain_types::CompactInt::bitcoin_deserialize(&mut reader)?.value() as usize;
        let mut outputs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let present = bool::bitcoin_deserialize(&mut reader)?;
            if present {
                let amount = i64::bitcoin_deserialize(&mut reader)?;
                let script = Script::bitcoin_deserialize(&mut reader)?;
                outputs.push(Some((amount, script)));
            } else {
                outputs.push(None);
            }
        }
        Ok(LegacyTxRecord {
            height,
            is_coinbase,
            outputs,
        })
    }
}

/// A script this layer treats as unspendable and therefore does not carry
/// forward into a `C`-record: empty scripts, and `OP_RETURN`-prefixed data
/// carriers. Full script interpretation is the script engine's job (out of
/// scope here); this is the same coarse check the legacy pruning code used.
fn is_unspendable(script: &Script) -> bool {
    match script.0.first() {
        None => true,
        Some(0x6a) => true, // OP_RETURN
        _ => false,
    }
}

fn tx_hash_from_legacy_key(key: &[u8]) -> Result<TxHash> {
    if key.len() != 33 {
        return Err(Error::Corrupt("legacy coin key has unexpected length".into()));
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&key[1..]);
    Ok(TxHash(bytes))
}

/// Runs the upgrade pass to completion (or until shutdown is requested),
/// reporting progress in 1% increments. Returns the number of legacy
/// records converted. Safe to call unconditionally at startup: if no
/// `c`-records are present it returns immediately with `0`.
pub fn run<KV: KeyValueBackend>(
    kvb: &KV,
    shutdown: &ShutdownToken,
    mut progress: impl Progress,
) -> Result<usize> {
    let legacy_keys: Vec<Box<[u8]>> = kvb
        .iter_prefix(&[keys::LEGACY_COIN])
        .map(|(key, _)| key)
        .collect();
    let total = legacy_keys.len();
    if total == 0 {
        return Ok(0);
    }
    info!(total, "starting legacy coin upgrade pass");

    let mut converted = 0usize;
    let mut last_reported_percent: u8 = 0;
    for (i, key) in legacy_keys.into_iter().enumerate() {
        if shutdown.is_shutdown_requested() {
            warn!(converted, total, "legacy coin upgrade interrupted");
            return Err(Error::Interrupted);
        }

        // Already converted and erased by a prior, interrupted run.
        let value = match kvb.get(&key)? {
            Some(value) => value,
            None => continue,
        };

        let tx_hash = tx_hash_from_legacy_key(&key)?;
        let record = LegacyTxRecord::bitcoin_deserialize(Cursor::new(value))?;

        let mut batch = kvb.new_batch();
        for (index, output) in record.outputs.iter().enumerate() {
            if let Some((amount, script)) = output {
                if is_unspendable(script) {
                    continue;
                }
                let outpoint = Outpoint::new(tx_hash, index as u32);
                let coin = Coin::new(*amount, script.clone(), record.height, record.is_coinbase);
                let bytes = coin
                    .bitcoin_serialize_to_vec()
                    .map_err(|e| Error::Corrupt(e.to_string()))?;
                batch.put(&keys::coin_key(&outpoint), &bytes);
            }
        }
        batch.delete(&key);
        kvb.write_batch(batch, false)?;

        converted += 1;
        let percent = (((i + 1) * 100) / total) as u8;
        if percent >= last_reported_percent.saturating_add(1) || i + 1 == total {
            progress.report(percent);
            last_reported_percent = percent;
        }
    }

    info!(converted, "legacy coin upgrade pass complete");
    Ok(converted)
}

/// Whether any legacy `c`-records remain, i.e. whether [`run`] must be
/// invoked (and `Error::UpgradeRequired` should be surfaced to the caller)
/// before normal coin-view operation can proceed.
pub fn upgrade_required<KV: KeyValueBackend>(kvb: &KV) -> Result<bool> {
    Ok(kvb.iter_prefix(&[keys::LEGACY_COIN]).next().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvb::RocksBackend;
    use chain_types::BitcoinSerialize;

    fn temp_backend() -> (tempdir::TempDir, RocksBackend) {
        let dir = tempdir::TempDir::new("chain-state-upgrade").unwrap();
        let backend = RocksBackend::open(dir.path(), 8).unwrap();
        (dir, backend)
    }

    fn write_legacy_record(kvb: &RocksBackend, tx_hash: TxHash, record: &LegacyTxRecordBuilder) {
        let mut key = vec![keys::LEGACY_COIN];
        key.extend_from_slice(tx_hash.as_bytes());
        let mut batch = kvb.new_batch();
        batch.put(&key, &record.to_bytes());
        kvb.write_batch(batch, true).unwrap();
    }

    /// A tiny hand-rolled encoder matching [`LegacyTxRecord`]'s wire format,
    /// used only by tests to fabricate legacy records to upgrade.
    struct LegacyTxRecordBuilder {
        height: u64,
        is_coinbase: bool,
        outputs: Vec<Option<(i64, Script)>>,
    }

    impl LegacyTxRecordBuilder {
        fn to_bytes(&self) -> Vec<u8> {
            let mut out = Vec::new();
            chain_types::CompactInt::from(self.height as usize)
                .bitcoin_serialize(&mut out)
                .unwrap();
            self.is_coinbase.bitcoin_serialize(&mut out).unwrap();
            chain_types::CompactInt::from(self.outputs.len())
                .bitcoin_serialize(&mut out)
                .unwrap();
            for output in &self.outputs {
                match output {
                    Some((amount, script)) => {
                        true.bitcoin_serialize(&mut out).unwrap();
                        amount.bitcoin_serialize(&mut out).unwrap();
                        script.bitcoin_serialize(&mut out).unwrap();
                    }
                    None => false.bitcoin_serialize(&mut out).unwrap(),
                }
            }
            out
        }
    }

    #[test]
    fn converts_legacy_record_into_per_output_coins() {
        let (_dir, backend) = temp_backend();
        let tx_hash = TxHash([5u8; 32]);
        let record = LegacyTxRecordBuilder {
            height: 12,
            is_coinbase: false,
            outputs: vec![
                Some((100, Script(vec![0x76, 0xa9]))),
                None,
                Some((200, Script(vec![0x6a, 0x01]))), // OP_RETURN: unspendable
            ],
        };
        write_legacy_record(&backend, tx_hash, &record);
        assert!(upgrade_required(&backend).unwrap());

        let converted = run(&backend, &ShutdownToken::new(), ()).unwrap();
        assert_eq!(converted, 1);
        assert!(!upgrade_required(&backend).unwrap());

        let kept = backend.get(&keys::coin_key(&Outpoint::new(tx_hash, 0))).unwrap();
        assert!(kept.is_some());
        let pruned = backend.get(&keys::coin_key(&Outpoint::new(tx_hash, 1))).unwrap();
        assert!(pruned.is_none());
        let op_return = backend.get(&keys::coin_key(&Outpoint::new(tx_hash, 2))).unwrap();
        assert!(op_return.is_none());
    }

    #[test]
    fn idempotent_on_resume() {
        let (_dir, backend) = temp_backend();
        let tx_hash = TxHash([6u8; 32]);
        let record = LegacyTxRecordBuilder {
            height: 1,
            is_coinbase: true,
            outputs: vec![Some((50, Script(vec![1, 2, 3])))],
        };
        write_legacy_record(&backend, tx_hash, &record);

        assert_eq!(run(&backend, &ShutdownToken::new(), ()).unwrap(), 1);
        // Running again finds nothing left to convert.
        assert_eq!(run(&backend, &ShutdownToken::new(), ()).unwrap(), 0);
    }

    #[test]
    fn interrupted_pass_returns_error_without_losing_progress() {
        let (_dir, backend) = temp_backend();
        for i in 0..3u8 {
            let tx_hash = TxHash([i; 32]);
            let record = LegacyTxRecordBuilder {
                height: i as u64,
                is_coinbase: false,
                outputs: vec![Some((1, Script(vec![9])))],
            };
            write_legacy_record(&backend, tx_hash, &record);
        }

        let shutdown = ShutdownToken::new();
        shutdown.request_shutdown();
        let result = run(&backend, &shutdown, ());
        assert!(matches!(result, Err(Error::Interrupted)));
    }
}
