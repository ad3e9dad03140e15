//! The chain-state persistence layer: the Coin View, Address Index, Block
//! Index Store, and Contract State Store backing a MagnaChain node.
//!
//! Each store borrows a reference to the key-value backend(s) it is opened
//! against rather than owning them, so a caller (the node daemon, or a
//! test) opens the backends, builds the stores over them, and is free to
//! hold its own long-lived mutable borrows without this crate imposing a
//! particular top-level struct shape. [`ChainState`] is a thin convenience
//! wrapper for the common case of "open everything at the default paths
//! under one `Config`"; nothing in the store modules themselves depends on
//! it.

pub mod addr_index;
pub mod block_index;
pub mod coin_view;
pub mod config;
pub mod contract_state;
pub mod error;
pub mod kvb;
pub mod shutdown;

use chain_types::{BlockHash, DestinationResolver, Outpoint};
use std::collections::HashMap;
use tracing::info;

use addr_index::AddrIndex;
use block_index::{BlockIndexChanges, BlockIndexStore};
use coin_view::{CacheEntry, CoinDb};
use config::Config;
use contract_state::ContractStateStore;
use error::Result;
use kvb::{KeyValueBackend, RocksBackend};
use shutdown::ShutdownToken;

/// Opens the three on-disk key-value backends a [`Config`] describes:
/// `chainstate/`, `blocks/index/`, and `contract/`. Kept separate from
/// [`ChainState`] so callers can hold these for as long as they like and
/// build the (borrowing) stores over them however they please.
pub struct Backends {
    pub coin: RocksBackend,
    pub block_index: RocksBackend,
    pub contract: RocksBackend,
}

impl Backends {
    pub fn open(config: &Config) -> Result<Self> {
        Ok(Backends {
            coin: RocksBackend::open(config.coin_db_path(), config.db_cache_mb)?,
            block_index: RocksBackend::open(config.block_index_path(), config.db_cache_mb)?,
            contract: RocksBackend::open(config.contract_db_path(), config.db_cache_mb)?,
        })
    }
}

/// One logical commit spanning the coin view, address index, and block
/// index, assembled by the caller (block-connection code, out of scope
/// here) and handed to [`ChainState::connect_block`] as a unit (§4.5).
/// Contract-state writes are not part of this struct: a contract's
/// [`ContractStateStore::execute_block`] call is made directly, ahead of
/// assembling this commit, since its own durable writes land in a
/// separate key-value backend and its result (which contracts actually
/// changed) is an input to building the block-index changes, not an
/// output of them.
pub struct BlockCommit {
    pub tip_hash: BlockHash,
    pub dirty_coins: HashMap<Outpoint, CacheEntry>,
    pub block_index_changes: BlockIndexChanges,
}

/// The four stores opened over one [`Backends`], plus the pieces needed to
/// assemble a logical cross-store commit: the address-index resolver and
/// the shutdown token every long-running pass polls.
pub struct ChainState<'kv> {
    coin_backend: &'kv RocksBackend,
    pub coins: CoinDb<'kv, RocksBackend>,
    pub addresses: AddrIndex<'kv, RocksBackend>,
    pub block_index: BlockIndexStore<'kv, RocksBackend>,
    pub contracts: ContractStateStore<'kv, RocksBackend>,
    config: Config,
    shutdown: ShutdownToken,
}

impl<'kv> ChainState<'kv> {
    pub fn new(backends: &'kv Backends, config: Config, resolve: DestinationResolver, shutdown: ShutdownToken) -> Self {
        ChainState {
            coin_backend: &backends.coin,
            coins: CoinDb::new(&backends.coin),
            addresses: AddrIndex::new(&backends.coin, resolve),
            block_index: BlockIndexStore::new(&backends.block_index),
            contracts: ContractStateStore::new(&backends.contract),
            config,
            shutdown,
        }
    }

    /// Runs every startup pass this layer needs before normal operation:
    /// the legacy coin-record upgrade (§4.2), then loading the block index
    /// into memory (§4.4).
    pub fn open(&mut self) -> Result<()> {
        if coin_view::upgrade::upgrade_required(self.coin_backend)? {
            coin_view::upgrade::run(self.coin_backend, &self.shutdown, ())?;
        }
        self.block_index.load(&self.shutdown)?;
        info!("chain state opened");
        Ok(())
    }

    /// Applies one logical commit: coin-view writes, the reverse-index
    /// writes they imply, and the block-index batch, all guarded by one
    /// transitional head-blocks marker (§4.5) — a crash partway through
    /// leaves the marker pointing at the old tip, and replaying from there
    /// is always safe to repeat.
    pub fn connect_block(&mut self, commit: BlockCommit) -> Result<()> {
        let block_index = &mut self.block_index;
        let mut changes = Some(commit.block_index_changes);
        self.coins.flush(
            commit.dirty_coins,
            commit.tip_hash,
            &mut self.addresses,
            &self.config,
            &self.shutdown,
            || {
                let changes = changes.take().expect("also_flush is only invoked once per commit");
                block_index.write_batch(changes)
            },
        )?;
        metrics::gauge!(
            "chain_state.coin_view.utxo_set_bytes",
            self.coin_backend.estimate_size(&[kvb::keys::COIN], &[kvb::keys::COIN + 1]) as f64
        );
        Ok(())
    }
}
