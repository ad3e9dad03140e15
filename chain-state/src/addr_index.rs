//! The Address Index: a reverse index from a script-derived address to the
//! set of outpoints currently owned by that address, driven by the same
//! dirty-entry stream the coin view flushes (§4.3).

use std::collections::{HashMap, HashSet};

use chain_types::{Address, BitcoinDeserialize, BitcoinSerialize, Coin, Destination, DestinationResolver, Outpoint};
use tracing::warn;

use crate::coin_view::CacheEntry;
use crate::error::{Error, Result};
use crate::kvb::{keys, KeyValueBackend, WriteBatch};
use crate::shutdown::ShutdownToken;

pub struct AddrIndex<'kv, KV: KeyValueBackend> {
    kvb: &'kv KV,
    resolve: DestinationResolver,
    /// Lazily loaded, mutated in memory, flushed in the same logical
    /// transaction as the coin view, then cleared.
    lists: HashMap<Address, Vec<Outpoint>>,
}

impl<'kv, KV: KeyValueBackend> AddrIndex<'kv, KV> {
    pub fn new(kvb: &'kv KV, resolve: DestinationResolver) -> Self {
        AddrIndex {
            kvb,
            resolve,
            lists: HashMap::new(),
        }
    }

    fn load(&self, address: &Address) -> Result<Vec<Outpoint>> {
        match self.kvb.get(&keys::address_key(address))? {
            Some(bytes) => Ok(Vec::<Outpoint>::bitcoin_deserialize(std::io::Cursor::new(bytes))?),
            None => Ok(Vec::new()),
        }
    }

    fn touch(&mut self, address: &Address) -> Result<&mut Vec<Outpoint>> {
        if !self.lists.contains_key(address) {
            let list = self.load(address)?;
            self.lists.insert(*address, list);
        }
        Ok(self.lists.get_mut(address).expect("just inserted"))
    }

    /// Returns the outpoints currently recorded for `address`: the cached
    /// list if one is staged, else a fresh read from the key-value backend.
    pub fn get_list(&mut self, address: &Address) -> Result<Vec<Outpoint>> {
        if let Some(list) = self.lists.get(address) {
            return Ok(list.clone());
        }
        self.load(address)
    }

    /// Interprets a batch of dirty coin-view entries, mutating the
    /// in-memory address lists but not yet writing them to disk; the write
    /// happens later, under the tip-transition marker, via [`Self::flush`].
    pub fn stage(&mut self, dirty: &HashMap<Outpoint, CacheEntry>) -> Result<()> {
        for (outpoint, entry) in dirty.iter() {
            self.stage_one(*outpoint, &entry.coin)?;
        }
        Ok(())
    }

    fn stage_one(&mut self, outpoint: Outpoint, coin: &Coin) -> Result<()> {
        if coin.is_coinbase {
            return Ok(());
        }
        let destination = (self.resolve)(&coin.script);
        let address = match destination {
            Destination::KeyHash(address) => address,
            _ => return Ok(()),
        };

        let list = self.touch(&address)?;
        if coin.is_spent {
            if let Some(pos) = list.iter().position(|o| *o == outpoint) {
                list.remove(pos);
            }
        } else if list.contains(&outpoint) {
            warn!(?outpoint, ?address, "duplicate address-index add ignored");
        } else {
            list.push(outpoint);
        }
        Ok(())
    }

    /// Writes every staged address list to the key-value backend in one
    /// batch, then clears the in-memory cache so it does not grow without
    /// bound across commits.
    pub fn flush(&mut self, shutdown: &ShutdownToken) -> Result<()> {
        if self.lists.is_empty() {
            return Ok(());
        }
        let mut batch = self.kvb.new_batch();
        for (address, outpoints) in self.lists.iter() {
            if shutdown.is_shutdown_requested() {
                return Err(Error::Interrupted);
            }
            let key = keys::address_key(address);
            if outpoints.is_empty() {
                batch.delete(&key);
            } else {
                let value = outpoints
                    .bitcoin_serialize_to_vec()
                    .map_err(|e| Error::Corrupt(e.to_string()))?;
                batch.put(&key, &value);
            }
        }
        self.kvb.write_batch(batch, true)?;
        self.lists.clear();
        Ok(())
    }

    /// The set of addresses with a currently staged (not yet flushed) list,
    /// for diagnostics and tests.
    pub fn staged_addresses(&self) -> HashSet<Address> {
        self.lists.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvb::RocksBackend;
    use chain_types::{Script, TxHash};

    fn key_hash_resolver(script: &Script) -> Destination {
        if script.0.len() == 20 {
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(&script.0);
            Destination::KeyHash(Address::key_hash(bytes))
        } else {
            Destination::Unresolved
        }
    }

    fn temp_backend() -> (tempdir::TempDir, RocksBackend) {
        let dir = tempdir::TempDir::new("chain-state-addr-index").unwrap();
        let backend = RocksBackend::open(dir.path(), 8).unwrap();
        (dir, backend)
    }

    #[test]
    fn add_then_spend_round_trips_through_flush() {
        let (_dir, backend) = temp_backend();
        let mut index = AddrIndex::new(&backend, key_hash_resolver);

        let address_bytes = [7u8; 20];
        let script = Script(address_bytes.to_vec());
        let outpoint = Outpoint::new(TxHash([1u8; 32]), 0);
        let coin = Coin::new(50, script.clone(), 0, false);

        let mut dirty = HashMap::new();
        dirty.insert(
            outpoint,
            CacheEntry {
                coin,
                dirty: true,
                fresh: true,
            },
        );
        index.stage(&dirty).unwrap();
        index.flush(&ShutdownToken::new()).unwrap();

        let address = Address::key_hash(address_bytes);
        let list = index.get_list(&address).unwrap();
        assert_eq!(list, vec![outpoint]);

        let mut spent_coin = Coin::new(50, script, 0, false);
        spent_coin.spend();
        let mut dirty = HashMap::new();
        dirty.insert(
            outpoint,
            CacheEntry {
                coin: spent_coin,
                dirty: true,
                fresh: false,
            },
        );
        index.stage(&dirty).unwrap();
        index.flush(&ShutdownToken::new()).unwrap();

        let list = index.get_list(&address).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn coinbase_outputs_are_not_indexed() {
        let (_dir, backend) = temp_backend();
        let mut index = AddrIndex::new(&backend, key_hash_resolver);

        let address_bytes = [9u8; 20];
        let outpoint = Outpoint::new(TxHash([2u8; 32]), 0);
        let coin = Coin::new(50, Script(address_bytes.to_vec()), 0, true);
        let mut dirty = HashMap::new();
        dirty.insert(
            outpoint,
            CacheEntry {
                coin,
                dirty: true,
                fresh: true,
            },
        );
        index.stage(&dirty).unwrap();
        assert!(index.staged_addresses().is_empty());
    }
}
