//! The Contract State Store: per-contract storage with per-height
//! snapshots, an in-memory execution cache with rollback, and a pruning
//! policy (§4.5).
//!
//! Three states per contract, per §4.5:
//!
//! - **Durable**: what [`ContractStateStore`] has written to its key-value
//!   backend.
//! - **Data**: the in-memory current state (durable plus committed blocks'
//!   deltas), held in [`ContractStateStore::data`] behind one mutex.
//! - **Cache**: the per-transaction working set inside an executing block,
//!   modeled by [`ContractCache`]; committed into Data on transaction
//!   success, discarded on failure.

mod store;
mod worker_pool;

pub use store::{ContractHeightEntry, ContractInfo, ContractStateStore, GroupReport};
pub use worker_pool::WorkerPool;

use crate::error::Result;

/// A contract identifier, matching [`chain_types::Destination::Contract`]'s
/// `contract_id` field.
pub type ContractId = [u8; 20];

/// One contract invocation: the caller (mempool/block-validation, out of
/// scope here) has already resolved which contract a transaction targets
/// and extracted its calldata; this layer only needs those two things to
/// dispatch execution and to know which contract's storage to stage.
#[derive(Clone, Debug)]
pub struct ContractInvocation {
    pub contract_id: ContractId,
    pub calldata: Vec<u8>,
    /// The net change this invocation requests to its contract's escrowed
    /// coin balance: positive deposits into escrow, negative withdraws from
    /// it. [`ContractStateStore::execute_block`]'s per-block balance cache
    /// rejects any invocation whose delta would drive the balance negative,
    /// per §4.5's "per-block coin-balance cache... enforces that
    /// contract-escrowed balances never go negative", without running the
    /// invocation's VM call or staging its storage writes.
    pub balance_delta: i64,
}

/// The per-transaction working set a [`ContractVm`] reads and writes
/// through. Reads miss to the contract's storage as it stood at the start
/// of the block (or the start of this transaction within a sequentially
/// executing group, whichever staged value is more recent); writes are
/// buffered locally and only become visible to other transactions once
/// [`Self::into_writes`] is folded back in by the caller.
pub struct ContractCache<'a> {
    base: &'a std::collections::HashMap<Vec<u8>, Vec<u8>>,
    writes: std::collections::HashMap<Vec<u8>, Vec<u8>>,
}

impl<'a> ContractCache<'a> {
    pub fn new(base: &'a std::collections::HashMap<Vec<u8>, Vec<u8>>) -> Self {
        ContractCache {
            base,
            writes: std::collections::HashMap::new(),
        }
    }

    pub fn read(&self, key: &[u8]) -> Option<&[u8]> {
        self.writes
            .get(key)
            .map(Vec::as_slice)
            .or_else(|| self.base.get(key).map(Vec::as_slice))
    }

    pub fn write(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, value);
    }

    /// Consumes the cache, returning only what was actually written (not
    /// `base`), for the caller to fold into the contract's staged storage.
    pub fn into_writes(self) -> std::collections::HashMap<Vec<u8>, Vec<u8>> {
        self.writes
    }
}

/// The scripting VM's execution entry point, as consumed by this layer.
/// The VM itself (out of scope: "the embedded scripting VM") is supplied by
/// the caller; `chain-state` only needs to call into one transaction at a
/// time against a [`ContractCache`] and observe success or failure.
pub trait ContractVm: Send {
    fn execute(&mut self, invocation: &ContractInvocation, cache: &mut ContractCache) -> Result<()>;
}
