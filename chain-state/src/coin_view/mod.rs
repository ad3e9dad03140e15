//! The Coin View: a stack of layered views over `(outpoint -> coin)` with a
//! tip-hash field. The durable leaf is [`CoinDb`]; [`CoinCache`] is the
//! in-memory layer with dirty/fresh tracking that block validation mutates
//! during connection of a block, and whose dirty entries are periodically
//! flushed down to [`CoinDb`] by [`CoinDb::flush`].

pub mod upgrade;

use std::collections::HashMap;

use chain_types::{BitcoinDeserialize, BitcoinSerialize, BlockHash, Coin, Outpoint};
use tracing::{debug, info, warn};

use crate::addr_index::AddrIndex;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::kvb::{keys, KeyValueBackend, WriteBatch};
use crate::shutdown::ShutdownToken;

/// A coin held in a [`CoinCache`], plus the tracking flags described by
/// invariant I5: FRESH implies the entry is absent in every lower layer;
/// DIRTY implies a write is owed downward.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub coin: Coin,
    pub dirty: bool,
    pub fresh: bool,
}

/// Anything that can answer point queries about live coins: a [`CoinDb`], a
/// [`CoinCache`] layered over one, or (by the caller, outside this crate) a
/// transient per-block snapshot layered over a `CoinCache`.
pub trait CoinView {
    fn get_coin(&self, outpoint: &Outpoint) -> Result<Option<Coin>>;

    fn have_coin(&self, outpoint: &Outpoint) -> Result<bool> {
        Ok(self.get_coin(outpoint)?.is_some())
    }
}

/// The in-memory cache layer. Reads miss to `parent` and memoize (without
/// DIRTY); spends and additions are tracked per the rules in §4.2.
pub struct CoinCache<'p, P: CoinView> {
    parent: &'p P,
    entries: HashMap<Outpoint, CacheEntry>,
    /// A running estimate of cache memory usage, in bytes, for the caller's
    /// own eviction policy; this layer does not evict on its own.
    cached_bytes: usize,
}

/// Rough per-entry overhead used for the cache's byte estimate: the coin's
/// serialized size plus the outpoint key and bookkeeping flags.
const ENTRY_OVERHEAD_BYTES: usize = 32 + 4 + 2;

impl<'p, P: CoinView> CoinCache<'p, P> {
    pub fn new(parent: &'p P) -> Self {
        CoinCache {
            parent,
            entries: HashMap::new(),
            cached_bytes: 0,
        }
    }

    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn memoize_from_parent(&mut self, outpoint: &Outpoint) -> Result<()> {
        if self.entries.contains_key(outpoint) {
            return Ok(());
        }
        if let Some(coin) = self.parent.get_coin(outpoint)? {
            self.account_insert(&coin);
            self.entries.insert(
                *outpoint,
                CacheEntry {
                    coin,
                    dirty: false,
                    fresh: false,
                },
            );
        }
        Ok(())
    }

    fn account_insert(&mut self, coin: &Coin) {
        self.cached_bytes += ENTRY_OVERHEAD_BYTES + coin.script.serialized_size();
    }

    /// Adds a newly created coin. FRESH is set when no parent layer has this
    /// outpoint, matching the rule in §4.2: "Addition of a coin not present
    /// in any parent creates a FRESH+DIRTY entry."
    pub fn add_coin(&mut self, outpoint: Outpoint, coin: Coin) -> Result<()> {
        let fresh = match self.entries.get(&outpoint) {
            Some(existing) => existing.fresh && existing.coin.is_spent,
            None => !self.parent.have_coin(&outpoint)?,
        };
        self.account_insert(&coin);
        self.entries.insert(
            outpoint,
            CacheEntry {
                coin,
                dirty: true,
                fresh,
            },
        );
        Ok(())
    }

    /// Marks the coin at `outpoint` spent, returning the coin as it stood
    /// immediately before the spend (for undo data), or `None` if it did not
    /// exist. A FRESH entry is erased outright rather than tombstoned, since
    /// no lower layer has ever seen it.
    pub fn spend_coin(&mut self, outpoint: &Outpoint) -> Result<Option<Coin>> {
        self.memoize_from_parent(outpoint)?;
        let fresh = match self.entries.get(outpoint) {
            Some(entry) if !entry.coin.is_spent => entry.fresh,
            _ => return Ok(None),
        };

        if fresh {
            let entry = self.entries.remove(outpoint).expect("checked above");
            return Ok(Some(entry.coin));
        }

        let entry = self.entries.get_mut(outpoint).expect("checked above");
        let coin_before = entry.coin.clone();
        entry.coin.spend();
        entry.dirty = true;
        Ok(Some(coin_before))
    }

    /// Returns the live coin at `outpoint`, checking the cache first and
    /// falling back to (and memoizing from) the parent view.
    pub fn get_coin_mut(&mut self, outpoint: &Outpoint) -> Result<Option<Coin>> {
        self.memoize_from_parent(outpoint)?;
        Ok(self
            .entries
            .get(outpoint)
            .filter(|e| !e.coin.is_spent)
            .map(|e| e.coin.clone()))
    }

    /// Drains every dirty entry out of the cache, for handoff to
    /// [`CoinDb::flush`]. Matches §4.2 step 3: "After consuming an entry
    /// remove it from the in-memory map so memory does not grow with batch
    /// size" — here the whole dirty set is removed up front, and the flush
    /// loop is responsible for bounding its own batch size.
    pub fn take_dirty(&mut self) -> HashMap<Outpoint, CacheEntry> {
        let dirty_keys: Vec<Outpoint> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(k, _)| *k)
            .collect();
        let mut dirty = HashMap::with_capacity(dirty_keys.len());
        for key in dirty_keys {
            if let Some(entry) = self.entries.remove(&key) {
                self.cached_bytes = self
                    .cached_bytes
                    .saturating_sub(ENTRY_OVERHEAD_BYTES + entry.coin.script.serialized_size());
                dirty.insert(key, entry);
            }
        }
        dirty
    }
}

impl<'p, P: CoinView> CoinView for CoinCache<'p, P> {
    fn get_coin(&self, outpoint: &Outpoint) -> Result<Option<Coin>> {
        if let Some(entry) = self.entries.get(outpoint) {
            return Ok((!entry.coin.is_spent).then(|| entry.coin.clone()));
        }
        self.parent.get_coin(outpoint)
    }
}

/// The durable leaf of the coin view: reads and writes go straight to the
/// key-value backend, guarded by the flush protocol in §4.2.
pub struct CoinDb<'kv, KV: KeyValueBackend> {
    kvb: &'kv KV,
}

/// What the transitional `head-blocks` marker on disk says about recovery,
/// per §4.2 "Recovery".
#[derive(Debug, Eq, PartialEq)]
pub enum RecoveryState {
    /// `B` names the last consistent tip; no commit was in flight.
    Consistent { tip: Option<BlockHash> },
    /// `H = [new_tip, old_tip]` is present: a commit from `old_tip` to
    /// `new_tip` was in progress when the process stopped. The caller must
    /// replay validation forward from `old_tip`.
    Transitional {
        new_tip: BlockHash,
        old_tip: Option<BlockHash>,
    },
}

impl<'kv, KV: KeyValueBackend> CoinDb<'kv, KV> {
    pub fn new(kvb: &'kv KV) -> Self {
        CoinDb { kvb }
    }

    pub fn get_best_block(&self) -> Result<Option<BlockHash>> {
        match self.kvb.get(&keys::best_block_key())? {
            Some(bytes) => Ok(Some(decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads the raw `head-blocks` record, if present: `[new_tip, old_tip]`.
    pub fn get_head_blocks(&self) -> Result<Option<(BlockHash, Option<BlockHash>)>> {
        match self.kvb.get(&keys::head_blocks_key())? {
            None => Ok(None),
            Some(bytes) => {
                if bytes.len() < 32 {
                    return Err(Error::Corrupt("head-blocks record too short".into()));
                }
                let new_tip = decode_hash(&bytes[..32])?;
                let old_tip = if bytes.len() >= 64 {
                    Some(decode_hash(&bytes[32..64])?)
                } else {
                    None
                };
                Ok(Some((new_tip, old_tip)))
            }
        }
    }

    /// Determines recovery state on startup (§4.2 "Recovery", invariant I2).
    pub fn recover(&self) -> Result<RecoveryState> {
        match self.get_head_blocks()? {
            Some((new_tip, old_tip)) => Ok(RecoveryState::Transitional { new_tip, old_tip }),
            None => Ok(RecoveryState::Consistent {
                tip: self.get_best_block()?,
            }),
        }
    }

    /// The durable commit, `BatchWrite(map, tip_hash)` from §4.2. `tip_hash`
    /// must not be null (invariant enforced by `Error::Invariant`).
    ///
    /// Coins are flushed to disk first (in batches bounded by
    /// `config.db_batch_size`), guarded by the transitional head-blocks
    /// marker; the reverse index is then flushed under the same marker;
    /// `also_flush` then lets the caller ride its own durable writes (the
    /// block index, the contract state store) under the same marker too,
    /// per §4.5; only once all of that has landed does the marker get
    /// replaced by the consistent `B = tip_hash` record.
    pub fn flush(
        &self,
        mut dirty: HashMap<Outpoint, CacheEntry>,
        tip_hash: BlockHash,
        addr_index: &mut AddrIndex<'kv, KV>,
        config: &Config,
        shutdown: &ShutdownToken,
        mut also_flush: impl FnMut() -> Result<()>,
    ) -> Result<()> {
        if tip_hash == BlockHash::default() {
            return Err(Error::Invariant("BatchWrite called with a null tip hash"));
        }
        info!(entries = dirty.len(), "flushing coin view");
        metrics::gauge!("chain_state.coin_view.dirty_entries", dirty.len() as f64);

        // Stage every dirty entry into the reverse index before step 3
        // starts draining `dirty`; `addr_index.flush` below only writes
        // whatever `stage` has queued up.
        addr_index.stage(&dirty)?;

        // Step 1: determine old_tip from whatever is currently on disk.
        let old_tip = match self.get_best_block()? {
            Some(_) => None,
            None => match self.get_head_blocks()? {
                Some((existing_new, existing_old)) if existing_new == tip_hash => existing_old,
                _ => None,
            },
        };

        // Step 2: write the transitional marker synchronously, ahead of any
        // coin data, per the ordering guarantee in §5.
        let mut marker_batch = self.kvb.new_batch();
        marker_batch.delete(&keys::best_block_key());
        marker_batch.put(&keys::head_blocks_key(), &encode_head_blocks(tip_hash, old_tip));
        self.kvb.write_batch(marker_batch, true)?;

        // Step 3/4: stream dirty coin entries, flushing whenever the batch
        // crosses db_batch_size.
        let mut batch = self.kvb.new_batch();
        let outpoints: Vec<Outpoint> = dirty.keys().copied().collect();
        let mut committed_coins: u64 = 0;
        let mut spent_coins: u64 = 0;
        for outpoint in outpoints {
            if shutdown.is_shutdown_requested() {
                return Err(Error::Interrupted);
            }
            let entry = dirty.remove(&outpoint).expect("key came from this map");
            let key = keys::coin_key(&outpoint);
            if entry.coin.is_spent {
                batch.delete(&key);
                spent_coins += 1;
            } else {
                let value = entry
                    .coin
                    .bitcoin_serialize_to_vec()
                    .map_err(|e| Error::Corrupt(e.to_string()))?;
                batch.put(&key, &value);
                committed_coins += 1;
            }

            if batch.size_in_bytes() >= config.db_batch_size {
                self.flush_partial_batch(&mut batch, config)?;
            }
        }
        metrics::counter!("chain_state.coin_view.committed_coins", committed_coins);
        metrics::counter!("chain_state.coin_view.spent_coins", spent_coins);
        if !batch.is_empty() {
            self.flush_partial_batch(&mut batch, config)?;
        }

        // Reverse index rides under the same marker, per §4.5's "caller
        // assembles one batch spanning CV, AddrIdx, BIS, and CSS" ordering
        // requirement.
        addr_index.flush(shutdown)?;

        // The block index and contract state store (if the caller has
        // pending writes for this block) ride under the same marker: a
        // crash here still leaves `H` pointing at `old_tip`, and a replay
        // from `old_tip` is always safe to repeat.
        also_flush()?;

        // Step 5: replace the transitional marker with the consistent form.
        let mut final_batch = self.kvb.new_batch();
        final_batch.delete(&keys::head_blocks_key());
        final_batch.put(&keys::best_block_key(), tip_hash.as_bytes());
        self.kvb.write_batch(final_batch, true)?;

        debug!(tip = %tip_hash, "coin view flush complete");
        Ok(())
    }

    fn flush_partial_batch(&self, batch: &mut <KV as KeyValueBackend>::Batch, config: &Config) -> Result<()> {
        self.kvb.write_batch(std::mem::take(batch), false)?;
        maybe_inject_crash(config.db_crash_ratio);
        Ok(())
    }
}

impl<'kv, KV: KeyValueBackend> CoinView for CoinDb<'kv, KV> {
    fn get_coin(&self, outpoint: &Outpoint) -> Result<Option<Coin>> {
        match self.kvb.get(&keys::coin_key(outpoint))? {
            Some(bytes) => {
                let coin = Coin::bitcoin_deserialize(std::io::Cursor::new(bytes))?;
                Ok(Some(coin))
            }
            None => Ok(None),
        }
    }
}

fn decode_hash(bytes: &[u8]) -> Result<BlockHash> {
    if bytes.len() < 32 {
        return Err(Error::Corrupt("hash record too short".into()));
    }
    let mut array = [0u8; 32];
    array.copy_from_slice(&bytes[..32]);
    Ok(BlockHash::from_bytes_exact(array))
}

fn encode_head_blocks(new_tip: BlockHash, old_tip: Option<BlockHash>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(new_tip.as_bytes());
    if let Some(old) = old_tip {
        out.extend_from_slice(old.as_bytes());
    }
    out
}

/// An optional fault-injection hook used by crash-consistency tests: aborts
/// the process with probability `1/db_crash_ratio` after a partial flush.
/// `db_crash_ratio == 0` disables it.
fn maybe_inject_crash(db_crash_ratio: u32) {
    if db_crash_ratio == 0 {
        return;
    }
    if rand::random::<u32>() % db_crash_ratio == 0 {
        warn!("fault injection: aborting process after partial flush");
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_types::{Script, TxHash};

    struct EmptyParent;
    impl CoinView for EmptyParent {
        fn get_coin(&self, _outpoint: &Outpoint) -> Result<Option<Coin>> {
            Ok(None)
        }
    }

    fn outpoint(byte: u8) -> Outpoint {
        Outpoint::new(TxHash([byte; 32]), 0)
    }

    fn coin(amount: i64) -> Coin {
        Coin::new(amount, Script(vec![1, 2, 3]), 0, false)
    }

    #[test]
    fn add_then_spend_fresh_entry_erases_outright() {
        let parent = EmptyParent;
        let mut cache = CoinCache::new(&parent);
        let op = outpoint(1);
        cache.add_coin(op, coin(10)).unwrap();
        assert!(cache.entries.get(&op).unwrap().fresh);

        let spent = cache.spend_coin(&op).unwrap();
        assert_eq!(spent.unwrap().amount, 10);
        assert!(!cache.entries.contains_key(&op));
        assert!(cache.take_dirty().is_empty());
    }

    #[test]
    fn flush_rejects_null_tip_hash() {
        let dir = tempdir::TempDir::new("chain-state-coin-db").unwrap();
        let backend = crate::kvb::RocksBackend::open(dir.path(), 8).unwrap();
        let coin_db = CoinDb::new(&backend);
        let mut addr_index = AddrIndex::new(&backend, |_| chain_types::Destination::Unresolved);
        let config = Config::default();
        let shutdown = ShutdownToken::new();

        let result = coin_db.flush(
            HashMap::new(),
            BlockHash::default(),
            &mut addr_index,
            &config,
            &shutdown,
            || Ok(()),
        );
        assert!(matches!(result, Err(Error::Invariant(_))));
    }

    #[test]
    fn spend_of_parent_coin_creates_dirty_non_fresh_entry() {
        struct OneCoinParent(Outpoint, Coin);
        impl CoinView for OneCoinParent {
            fn get_coin(&self, outpoint: &Outpoint) -> Result<Option<Coin>> {
                Ok((*outpoint == self.0).then(|| self.1.clone()))
            }
        }
        let op = outpoint(2);
        let parent = OneCoinParent(op, coin(20));
        let mut cache = CoinCache::new(&parent);

        cache.spend_coin(&op).unwrap();
        let dirty = cache.take_dirty();
        let entry = dirty.get(&op).unwrap();
        assert!(!entry.fresh);
        assert!(entry.coin.is_spent);
    }
}
