//! The durable contract-state store: per-contract info and storage cells,
//! per-height reverse-delta history, and the execution/rollback/pruning
//! operations built on top of them (§4.5).

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

use chain_types::{BitcoinDeserialize, BitcoinSerialize, BlockHash, CompactInt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::kvb::{keys, KeyValueBackend, WriteBatch};

use super::worker_pool::WorkerPool;
use super::{ContractCache, ContractId, ContractInvocation, ContractVm};

/// A contract's full state as held by [`ContractStateStore::data`]: its
/// program bytes and its current storage map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContractInfo {
    pub program: Vec<u8>,
    pub storage: HashMap<Vec<u8>, Vec<u8>>,
    /// The contract's escrowed coin balance, maintained alongside its
    /// storage by the per-block balance cache (§4.5); never negative.
    pub balance: i64,
}

/// One contract's history at one height: what to undo to take that
/// contract back to how it stood immediately before this height.
#[derive(Clone, Debug)]
pub struct ContractHeightEntry {
    pub block_hash: BlockHash,
    /// For every storage key this contract's block changed: the prior
    /// value, or `None` if the key did not exist before this block.
    pub reverse_delta: HashMap<Vec<u8>, Option<Vec<u8>>>,
    /// Whether the contract did not exist before this block, so rolling
    /// back past this entry deletes the contract rather than reverting it.
    pub created: bool,
    /// The contract's escrowed coin balance immediately before this block,
    /// restored verbatim on rollback (§4.5's balance cache has no per-key
    /// delta structure to diff, so the prior value is carried whole).
    pub balance_before: i64,
}

fn encode_height_entry(entry: &ContractHeightEntry) -> Vec<u8> {
    let mut out = Vec::new();
    entry
        .block_hash
        .bitcoin_serialize(&mut out)
        .expect("writing to a Vec is infallible");
    entry
        .created
        .bitcoin_serialize(&mut out)
        .expect("writing to a Vec is infallible");
    entry
        .balance_before
        .bitcoin_serialize(&mut out)
        .expect("writing to a Vec is infallible");
    CompactInt::from(entry.reverse_delta.len())
        .bitcoin_serialize(&mut out)
        .expect("writing to a Vec is infallible");
    for (key, prior) in &entry.reverse_delta {
        key.bitcoin_serialize(&mut out).expect("writing to a Vec is infallible");
        match prior {
            Some(value) => {
                true.bitcoin_serialize(&mut out).expect("writing to a Vec is infallible");
                value.bitcoin_serialize(&mut out).expect("writing to a Vec is infallible");
            }
            None => false.bitcoin_serialize(&mut out).expect("writing to a Vec is infallible"),
        }
    }
    out
}

fn decode_height_entry(bytes: &[u8]) -> Result<ContractHeightEntry> {
    let mut cursor = Cursor::new(bytes);
    let block_hash = BlockHash::bitcoin_deserialize(&mut cursor)?;
    let created = bool::bitcoin_deserialize(&mut cursor)?;
    let balance_before = i64::bitcoin_deserialize(&mut cursor)?;
    let count = CompactInt::bitcoin_deserialize(&mut cursor)?.value() as usize;
    let mut reverse_delta = HashMap::with_capacity(count.min(4096));
    for _ in 0..count {
        let key = Vec::<u8>::bitcoin_deserialize(&mut cursor)?;
        let present = bool::bitcoin_deserialize(&mut cursor)?;
        let prior = if present {
            Some(Vec::<u8>::bitcoin_deserialize(&mut cursor)?)
        } else {
            None
        };
        reverse_delta.insert(key, prior);
    }
    Ok(ContractHeightEntry {
        block_hash,
        reverse_delta,
        created,
        balance_before,
    })
}

/// The height suffix of a `CONTRACT_HEIGHT` key, read back out of the key
/// bytes (the value only carries the entry, not its own height).
fn height_from_key(contract_id: &ContractId, key: &[u8]) -> Result<u32> {
    let expected_len = 1 + contract_id.len() + 4;
    if key.len() != expected_len {
        return Err(Error::Corrupt("contract height key has unexpected length".into()));
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&key[key.len() - 4..]);
    Ok(u32::from_be_bytes(bytes))
}

/// One conflict-free group's outcome: its staged contract states (base
/// snapshot plus whatever the group's transactions wrote) and a per-tx
/// success/failure report.
struct StagedContract {
    base: ContractInfo,
    current: ContractInfo,
}

/// The result of executing one transaction group, returned to the caller
/// of [`ContractStateStore::execute_block`] so it can decide what to do
/// with transactions that failed (e.g. drop them from the block, for a
/// mempool-adjacent caller; out of scope here).
pub struct GroupReport {
    pub tx_results: Vec<Result<()>>,
}

/// The contract-state persistence layer: durable storage plus the
/// in-memory "Data" cache that execution reads and writes through.
pub struct ContractStateStore<'kv, KV: KeyValueBackend> {
    kvb: &'kv KV,
    data: Mutex<HashMap<ContractId, ContractInfo>>,
}

impl<'kv, KV: KeyValueBackend> ContractStateStore<'kv, KV> {
    pub fn new(kvb: &'kv KV) -> Self {
        ContractStateStore {
            kvb,
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Reads a contract's durable state into `data` if not already
    /// present, returning `None` if no such contract has ever been
    /// deployed.
    fn load_contract_locked(&self, data: &mut HashMap<ContractId, ContractInfo>, id: &ContractId) -> Result<Option<ContractInfo>> {
        if let Some(info) = data.get(id) {
            return Ok(Some(info.clone()));
        }
        let program = match self.kvb.get(&keys::contract_info_key(id))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let mut storage = HashMap::new();
        let prefix = keys::contract_storage_prefix(id);
        for (key, value) in self.kvb.iter_prefix(&prefix) {
            let storage_key = key[prefix.len()..].to_vec();
            storage.insert(storage_key, value.into_vec());
        }
        let balance = match self.kvb.get(&keys::contract_balance_key(id))? {
            Some(bytes) => i64::bitcoin_deserialize(Cursor::new(bytes))?,
            None => 0,
        };
        let info = ContractInfo { program, storage, balance };
        data.insert(*id, info.clone());
        Ok(Some(info))
    }

    /// Returns a contract's current state, reading through to durable
    /// storage on first access. `None` means the contract has never been
    /// deployed (and has no recorded history either).
    pub fn get(&self, id: &ContractId) -> Result<Option<ContractInfo>> {
        let mut data = self.data.lock().expect("contract data mutex poisoned");
        self.load_contract_locked(&mut data, id)
    }

    /// Validates that the sets of contract ids touched by each group are
    /// pairwise disjoint — the precondition [`Self::execute_block`]
    /// requires so that groups can run without synchronizing with each
    /// other mid-execution.
    fn touched_ids(invocations: &[ContractInvocation]) -> Vec<ContractId> {
        let mut ids: Vec<ContractId> = invocations.iter().map(|i| i.contract_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn validate_disjoint_groups(groups: &[Vec<ContractId>]) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for group in groups {
            for id in group {
                if !seen.insert(*id) {
                    return Err(Error::Invariant(
                        "contract transaction groups are not conflict-free: one contract appears in more than one group",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Executes one block's worth of conflict-free transaction groups
    /// against a worker pool, records the resulting per-height history
    /// entries, and writes the new contract states and history durably.
    /// Groups run in parallel; transactions within a group run
    /// sequentially against that group's own staged contract states, so a
    /// failing transaction neither sees nor produces writes from its
    /// group's later transactions.
    pub fn execute_block<Vm: ContractVm>(
        &self,
        pool: &WorkerPool<Vm>,
        groups: Vec<Vec<ContractInvocation>>,
        height: u32,
        block_hash: BlockHash,
    ) -> Result<Vec<GroupReport>> {
        let touched_per_group: Vec<Vec<ContractId>> = groups.iter().map(|g| Self::touched_ids(g)).collect();
        Self::validate_disjoint_groups(&touched_per_group)?;

        let mut staged: Vec<HashMap<ContractId, StagedContract>> = Vec::with_capacity(groups.len());
        {
            let mut data = self.data.lock().expect("contract data mutex poisoned");
            for ids in &touched_per_group {
                let mut group_map = HashMap::with_capacity(ids.len());
                for id in ids {
                    let info = self
                        .load_contract_locked(&mut data, id)?
                        .unwrap_or_default();
                    group_map.insert(
                        *id,
                        StagedContract {
                            base: info.clone(),
                            current: info,
                        },
                    );
                }
                staged.push(group_map);
            }
        }

        let work_items: Vec<(Vec<ContractInvocation>, HashMap<ContractId, StagedContract>)> =
            groups.into_iter().zip(staged.into_iter()).collect();

        let outcomes: Vec<(HashMap<ContractId, StagedContract>, GroupReport)> = pool.run(work_items, |(group, mut group_map), vm| {
            let mut tx_results = Vec::with_capacity(group.len());
            for invocation in &group {
                let contract = group_map
                    .get_mut(&invocation.contract_id)
                    .expect("every invocation's contract id was staged above");
                let new_balance = contract.current.balance + invocation.balance_delta;
                if new_balance < 0 {
                    tx_results.push(Err(Error::Invariant(
                        "invocation would drive contract-escrowed balance negative",
                    )));
                    continue;
                }
                let mut cache = ContractCache::new(&contract.current.storage);
                let outcome = vm.execute(invocation, &mut cache);
                if outcome.is_ok() {
                    contract.current.storage.extend(cache.into_writes());
                    contract.current.balance = new_balance;
                }
                tx_results.push(outcome);
            }
            (group_map, GroupReport { tx_results })
        });

        let mut data = self.data.lock().expect("contract data mutex poisoned");
        let mut batch = self.kvb.new_batch();
        let mut reports = Vec::with_capacity(outcomes.len());
        for (group_map, report) in outcomes {
            for (id, staged) in group_map {
                if staged.current == staged.base {
                    continue;
                }
                let created = !data.contains_key(&id);
                let reverse_delta = diff_storage(&staged.base.storage, &staged.current.storage);

                if created || staged.current.program != staged.base.program {
                    batch.put(&keys::contract_info_key(&id), &staged.current.program);
                }
                for (key, prior) in &reverse_delta {
                    let storage_key = keys::contract_storage_key(&id, key);
                    match staged.current.storage.get(key) {
                        Some(value) => batch.put(&storage_key, value),
                        None => batch.delete(&storage_key),
                    }
                }
                if staged.current.balance != staged.base.balance {
                    let mut encoded = Vec::new();
                    staged
                        .current
                        .balance
                        .bitcoin_serialize(&mut encoded)
                        .expect("writing to a Vec is infallible");
                    batch.put(&keys::contract_balance_key(&id), &encoded);
                }
                let entry = ContractHeightEntry {
                    block_hash,
                    reverse_delta,
                    created,
                    balance_before: staged.base.balance,
                };
                batch.put(&keys::contract_height_key(&id, height), &encode_height_entry(&entry));

                data.insert(id, staged.current);
            }
            reports.push(report);
        }
        drop(data);
        self.kvb.write_batch(batch, true)?;
        Ok(reports)
    }

    /// Rolls every touched contract back past `height`, applying its
    /// reverse delta (and deleting the contract outright if it was
    /// created at that height) and erasing the now-consumed history
    /// entry. Used when a reorg disconnects the block at `height`.
    pub fn rollback_block(&self, contract_ids: &[ContractId], height: u32) -> Result<()> {
        let mut data = self.data.lock().expect("contract data mutex poisoned");
        let mut batch = self.kvb.new_batch();
        for id in contract_ids {
            let key = keys::contract_height_key(id, height);
            let bytes = match self.kvb.get(&key)? {
                Some(bytes) => bytes,
                None => continue,
            };
            let entry = decode_height_entry(&bytes)?;
            let mut info = self.load_contract_locked(&mut data, id)?.unwrap_or_default();

            for (storage_key, prior) in &entry.reverse_delta {
                match prior {
                    Some(value) => {
                        info.storage.insert(storage_key.clone(), value.clone());
                        batch.put(&keys::contract_storage_key(id, storage_key), value);
                    }
                    None => {
                        info.storage.remove(storage_key);
                        batch.delete(&keys::contract_storage_key(id, storage_key));
                    }
                }
            }
            batch.delete(&key);

            if entry.created {
                data.remove(id);
                batch.delete(&keys::contract_info_key(id));
                batch.delete(&keys::contract_balance_key(id));
            } else {
                info.balance = entry.balance_before;
                let mut encoded = Vec::new();
                info.balance
                    .bitcoin_serialize(&mut encoded)
                    .expect("writing to a Vec is infallible");
                batch.put(&keys::contract_balance_key(id), &encoded);
                data.insert(*id, info);
            }
        }
        drop(data);
        self.kvb.write_batch(batch, true)?;
        Ok(())
    }

    fn list_height_entries(&self, id: &ContractId) -> Result<Vec<(u32, ContractHeightEntry)>> {
        let prefix = keys::contract_height_prefix(id);
        let mut entries = Vec::new();
        for (key, value) in self.kvb.iter_prefix(&prefix) {
            let height = height_from_key(id, &key)?;
            entries.push((height, decode_height_entry(&value)?));
        }
        entries.sort_by_key(|(height, _)| *height);
        Ok(entries)
    }

    /// Coalesces every history entry older than `finality_height` into the
    /// single oldest entry that remains at or above it, so a rollback to
    /// any height still reachable (at or above the horizon) stays
    /// possible while the deeper, unreachable-by-reorg entries are
    /// dropped. A no-op if fewer than two entries fall below the horizon.
    pub fn prune(&self, id: &ContractId, finality_height: u32) -> Result<()> {
        metrics::gauge!("chain_state.contract_state.pruning_horizon", finality_height as f64);
        let entries = self.list_height_entries(id)?;
        let split = entries.partition_point(|(height, _)| *height < finality_height);
        if split <= 1 {
            return Ok(());
        }
        let old = &entries[..split];
        let (anchor_height, anchor_tail) = (old.last().unwrap().0, &old.last().unwrap().1);
        let anchor_block_hash = anchor_tail.block_hash;
        let created = old.first().unwrap().1.created;
        let balance_before = old.first().unwrap().1.balance_before;

        let mut combined_delta: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
        for (_, entry) in old.iter().rev() {
            for (key, prior) in &entry.reverse_delta {
                combined_delta.insert(key.clone(), prior.clone());
            }
        }

        let mut batch = self.kvb.new_batch();
        for (height, _) in &old[..old.len() - 1] {
            batch.delete(&keys::contract_height_key(id, *height));
        }
        let anchor = ContractHeightEntry {
            block_hash: anchor_block_hash,
            reverse_delta: combined_delta,
            created,
            balance_before,
        };
        batch.put(&keys::contract_height_key(id, anchor_height), &encode_height_entry(&anchor));
        self.kvb.write_batch(batch, true)?;
        debug!(?id, finality_height, collapsed = old.len() - 1, "pruned contract history");
        Ok(())
    }
}

/// Diffs a contract's storage before and after a block, producing the
/// reverse delta needed to undo it: the prior value for every key that
/// changed, added, or was removed.
fn diff_storage(base: &HashMap<Vec<u8>, Vec<u8>>, current: &HashMap<Vec<u8>, Vec<u8>>) -> HashMap<Vec<u8>, Option<Vec<u8>>> {
    let mut delta = HashMap::new();
    for (key, value) in current {
        match base.get(key) {
            Some(old) if old == value => {}
            Some(old) => {
                delta.insert(key.clone(), Some(old.clone()));
            }
            None => {
                delta.insert(key.clone(), None);
            }
        }
    }
    for (key, old) in base {
        if !current.contains_key(key) {
            delta.insert(key.clone(), Some(old.clone()));
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract_state::WorkerPool;
    use crate::kvb::RocksBackend;

    fn temp_backend() -> (tempdir::TempDir, RocksBackend) {
        let dir = tempdir::TempDir::new("chain-state-contracts").unwrap();
        let backend = RocksBackend::open(dir.path(), 8).unwrap();
        (dir, backend)
    }

    /// A VM that writes `invocation.calldata` under the fixed key `b"k"`,
    /// or fails outright if the calldata is empty — enough to exercise
    /// success, failure, and rollback without a real scripting engine.
    struct ScriptedVm;
    impl ContractVm for ScriptedVm {
        fn execute(&mut self, invocation: &ContractInvocation, cache: &mut ContractCache) -> Result<()> {
            if invocation.calldata.is_empty() {
                return Err(Error::Invariant("empty calldata"));
            }
            cache.write(b"k".to_vec(), invocation.calldata.clone());
            Ok(())
        }
    }

    fn invocation(id: ContractId, payload: &[u8]) -> ContractInvocation {
        invocation_with_balance(id, payload, 0)
    }

    fn invocation_with_balance(id: ContractId, payload: &[u8], balance_delta: i64) -> ContractInvocation {
        ContractInvocation {
            contract_id: id,
            calldata: payload.to_vec(),
            balance_delta,
        }
    }

    #[test]
    fn execute_block_persists_storage_and_history_entry() {
        let (_dir, backend) = temp_backend();
        let store = ContractStateStore::new(&backend);
        let pool = WorkerPool::new(2, || ScriptedVm);
        let id = [1u8; 20];

        let reports = store
            .execute_block(&pool, vec![vec![invocation(id, b"v1")]], 10, BlockHash([10u8; 32]))
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].tx_results[0].is_ok());

        let info = store.get(&id).unwrap().unwrap();
        assert_eq!(info.storage.get(b"k".as_slice()), Some(&b"v1".to_vec()));
    }

    #[test]
    fn execute_block_rejects_overlapping_groups() {
        let (_dir, backend) = temp_backend();
        let store = ContractStateStore::new(&backend);
        let pool = WorkerPool::new(2, || ScriptedVm);
        let id = [2u8; 20];

        let result = store.execute_block(
            &pool,
            vec![vec![invocation(id, b"a")], vec![invocation(id, b"b")]],
            1,
            BlockHash([1u8; 32]),
        );
        assert!(matches!(result, Err(Error::Invariant(_))));
    }

    #[test]
    fn failed_transaction_does_not_affect_storage() {
        let (_dir, backend) = temp_backend();
        let store = ContractStateStore::new(&backend);
        let pool = WorkerPool::new(2, || ScriptedVm);
        let id = [3u8; 20];

        let reports = store
            .execute_block(&pool, vec![vec![invocation(id, b"")]], 1, BlockHash([1u8; 32]))
            .unwrap();
        assert!(reports[0].tx_results[0].is_err());
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn rollback_restores_prior_storage_and_deletes_created_contract() {
        let (_dir, backend) = temp_backend();
        let store = ContractStateStore::new(&backend);
        let pool = WorkerPool::new(2, || ScriptedVm);
        let id = [4u8; 20];

        store
            .execute_block(&pool, vec![vec![invocation(id, b"first")]], 5, BlockHash([5u8; 32]))
            .unwrap();
        assert!(store.get(&id).unwrap().is_some());

        store.rollback_block(&[id], 5).unwrap();
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn rollback_reverts_to_prior_value_without_deleting_existing_contract() {
        let (_dir, backend) = temp_backend();
        let store = ContractStateStore::new(&backend);
        let pool = WorkerPool::new(2, || ScriptedVm);
        let id = [5u8; 20];

        store
            .execute_block(&pool, vec![vec![invocation(id, b"v1")]], 1, BlockHash([1u8; 32]))
            .unwrap();
        store
            .execute_block(&pool, vec![vec![invocation(id, b"v2")]], 2, BlockHash([2u8; 32]))
            .unwrap();
        assert_eq!(
            store.get(&id).unwrap().unwrap().storage.get(b"k".as_slice()),
            Some(&b"v2".to_vec())
        );

        store.rollback_block(&[id], 2).unwrap();
        assert_eq!(
            store.get(&id).unwrap().unwrap().storage.get(b"k".as_slice()),
            Some(&b"v1".to_vec())
        );
    }

    #[test]
    fn prune_coalesces_old_entries_but_preserves_rollback_to_horizon() {
        let (_dir, backend) = temp_backend();
        let store = ContractStateStore::new(&backend);
        let pool = WorkerPool::new(2, || ScriptedVm);
        let id = [6u8; 20];

        for (height, payload) in [(1u32, &b"v1"[..]), (2, b"v2"), (3, b"v3"), (4, b"v4")] {
            store
                .execute_block(&pool, vec![vec![invocation(id, payload)]], height, BlockHash([height as u8; 32]))
                .unwrap();
        }

        store.prune(&id, 3).unwrap();

        let remaining = store.list_height_entries(&id).unwrap();
        // Heights 1 and 2 collapse into height 2 (the oldest entry still
        // at or above the horizon's predecessor); 3 and 4 are untouched.
        assert_eq!(remaining.iter().map(|(h, _)| *h).collect::<Vec<_>>(), vec![2, 3, 4]);

        store.rollback_block(&[id], 4).unwrap();
        store.rollback_block(&[id], 3).unwrap();
        store.rollback_block(&[id], 2).unwrap();
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn deposit_commits_balance_alongside_storage() {
        let (_dir, backend) = temp_backend();
        let store = ContractStateStore::new(&backend);
        let pool = WorkerPool::new(2, || ScriptedVm);
        let id = [7u8; 20];

        let reports = store
            .execute_block(&pool, vec![vec![invocation_with_balance(id, b"v1", 100)]], 1, BlockHash([1u8; 32]))
            .unwrap();
        assert!(reports[0].tx_results[0].is_ok());

        let info = store.get(&id).unwrap().unwrap();
        assert_eq!(info.balance, 100);
        assert_eq!(info.storage.get(b"k".as_slice()), Some(&b"v1".to_vec()));
    }

    #[test]
    fn withdrawal_driving_balance_negative_is_rejected_without_side_effects() {
        let (_dir, backend) = temp_backend();
        let store = ContractStateStore::new(&backend);
        let pool = WorkerPool::new(2, || ScriptedVm);
        let id = [8u8; 20];

        store
            .execute_block(&pool, vec![vec![invocation_with_balance(id, b"v1", 50)]], 1, BlockHash([1u8; 32]))
            .unwrap();

        let reports = store
            .execute_block(&pool, vec![vec![invocation_with_balance(id, b"v2", -100)]], 2, BlockHash([2u8; 32]))
            .unwrap();
        assert!(matches!(reports[0].tx_results[0], Err(Error::Invariant(_))));

        // Rejected purely on the balance check: the VM never ran, so the
        // storage write it would have made is absent and the balance is
        // untouched.
        let info = store.get(&id).unwrap().unwrap();
        assert_eq!(info.balance, 50);
        assert_eq!(info.storage.get(b"k".as_slice()), Some(&b"v1".to_vec()));
    }

    #[test]
    fn rollback_restores_balance_before_the_block() {
        let (_dir, backend) = temp_backend();
        let store = ContractStateStore::new(&backend);
        let pool = WorkerPool::new(2, || ScriptedVm);
        let id = [9u8; 20];

        store
            .execute_block(&pool, vec![vec![invocation_with_balance(id, b"v1", 30)]], 1, BlockHash([1u8; 32]))
            .unwrap();
        store
            .execute_block(&pool, vec![vec![invocation_with_balance(id, b"v2", 20)]], 2, BlockHash([2u8; 32]))
            .unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().balance, 50);

        store.rollback_block(&[id], 2).unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().balance, 30);

        store.rollback_block(&[id], 1).unwrap();
        assert!(store.get(&id).unwrap().is_none());
    }
}
