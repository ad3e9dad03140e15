//! Single-byte key-namespace prefixes and the key builders for each of them.
//!
//! Every key in every store this crate opens starts with one of these
//! prefix bytes followed by a structured tail; keeping the builders in one
//! place means the wire layout of a key is defined exactly once.

use chain_types::{Address, BitcoinSerialize, BlockHash, Outpoint, TxHash};

pub const COIN: u8 = b'C';
pub const BLOCK_FILE_INFO: u8 = b'f';
pub const TX_INDEX: u8 = b't';
pub const BLOCK_INDEX: u8 = b'b';
pub const BEST_BLOCK: u8 = b'B';
pub const HEAD_BLOCKS: u8 = b'H';
pub const FLAG: u8 = b'F';
pub const REINDEX: u8 = b'R';
pub const LAST_BLOCK_FILE: u8 = b'l';
pub const ADDRESS: u8 = b'A';
/// Legacy per-transaction coin record, upgraded in place on first startup.
pub const LEGACY_COIN: u8 = b'c';

// The contract-state store's key namespace lives in its own `contract/`
// KVB instance (§6), so these prefixes do not need to be disjoint from the
// ones above; they are chosen to read the same way regardless.
/// Contract info record: program bytes + current storage map, in the
/// contract-state KVB.
pub const CONTRACT_INFO: u8 = b'i';
/// Contract storage cell, keyed by contract id + storage key tail.
pub const CONTRACT_STORAGE: u8 = b's';
/// Per-height contract history entry, keyed by contract id + big-endian
/// height tail so entries for one contract sort in height order.
pub const CONTRACT_HEIGHT: u8 = b'h';
/// A contract's escrowed coin balance, tracked alongside its storage so the
/// per-block coin-balance cache (§4.5) can enforce it never goes negative.
pub const CONTRACT_BALANCE: u8 = b'e';

/// `C` ‖ 32-byte tx-hash ‖ varint output index.
pub fn coin_key(outpoint: &Outpoint) -> Vec<u8> {
    let mut key = vec![COIN];
    outpoint
        .bitcoin_serialize(&mut key)
        .expect("writing to a Vec is infallible");
    key
}

/// `c` ‖ 32-byte tx-hash, the legacy per-transaction record this store
/// upgrades in place.
pub fn legacy_coin_key(tx_hash: &TxHash) -> Vec<u8> {
    let mut key = vec![LEGACY_COIN];
    key.extend_from_slice(tx_hash.as_bytes());
    key
}

/// `f` ‖ i32 little-endian file number.
pub fn block_file_info_key(file_number: i32) -> Vec<u8> {
    let mut key = vec![BLOCK_FILE_INFO];
    key.extend_from_slice(&file_number.to_le_bytes());
    key
}

/// `b` ‖ 32-byte block hash.
pub fn block_index_key(hash: &BlockHash) -> Vec<u8> {
    let mut key = vec![BLOCK_INDEX];
    key.extend_from_slice(hash.as_bytes());
    key
}

/// `t` ‖ 32-byte tx hash, pointing at that transaction's position.
pub fn tx_index_key(hash: &TxHash) -> Vec<u8> {
    let mut key = vec![TX_INDEX];
    key.extend_from_slice(hash.as_bytes());
    key
}

/// `A` ‖ 20-byte address.
pub fn address_key(address: &Address) -> Vec<u8> {
    let mut key = vec![ADDRESS];
    key.extend_from_slice(address.payload());
    key
}

/// `F` ‖ length-prefixed flag name.
pub fn flag_key(name: &str) -> Vec<u8> {
    let mut key = vec![FLAG];
    chain_types::CompactInt::from(name.len())
        .bitcoin_serialize(&mut key)
        .expect("writing to a Vec is infallible");
    key.extend_from_slice(name.as_bytes());
    key
}

/// The sole key of the best-block record: `B`.
pub fn best_block_key() -> Vec<u8> {
    vec![BEST_BLOCK]
}

/// The sole key of the transitional head-blocks marker: `H`.
pub fn head_blocks_key() -> Vec<u8> {
    vec![HEAD_BLOCKS]
}

/// The sole key of the reindex-in-progress flag: `R`.
pub fn reindex_key() -> Vec<u8> {
    vec![REINDEX]
}

/// The sole key of the last-used block-file number: `l`.
pub fn last_block_file_key() -> Vec<u8> {
    vec![LAST_BLOCK_FILE]
}

/// `i` ‖ 20-byte contract id.
pub fn contract_info_key(contract_id: &[u8; 20]) -> Vec<u8> {
    let mut key = vec![CONTRACT_INFO];
    key.extend_from_slice(contract_id);
    key
}

/// `s` ‖ 20-byte contract id ‖ storage key tail, so a contract's cells sort
/// contiguously and can be prefix-scanned for pruning/debugging.
pub fn contract_storage_key(contract_id: &[u8; 20], storage_key: &[u8]) -> Vec<u8> {
    let mut key = vec![CONTRACT_STORAGE];
    key.extend_from_slice(contract_id);
    key.extend_from_slice(storage_key);
    key
}

/// `s` ‖ 20-byte contract id, the prefix covering every cell of one contract.
pub fn contract_storage_prefix(contract_id: &[u8; 20]) -> Vec<u8> {
    let mut key = vec![CONTRACT_STORAGE];
    key.extend_from_slice(contract_id);
    key
}

/// `h` ‖ 20-byte contract id ‖ big-endian u32 height, so a range scan over
/// one contract's history visits entries in ascending height order.
pub fn contract_height_key(contract_id: &[u8; 20], height: u32) -> Vec<u8> {
    let mut key = vec![CONTRACT_HEIGHT];
    key.extend_from_slice(contract_id);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// `h` ‖ 20-byte contract id, the prefix covering every history entry of one
/// contract.
pub fn contract_height_prefix(contract_id: &[u8; 20]) -> Vec<u8> {
    let mut key = vec![CONTRACT_HEIGHT];
    key.extend_from_slice(contract_id);
    key
}

/// `e` ‖ 20-byte contract id, the contract's escrowed coin balance.
pub fn contract_balance_key(contract_id: &[u8; 20]) -> Vec<u8> {
    let mut key = vec![CONTRACT_BALANCE];
    key.extend_from_slice(contract_id);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_key_has_expected_prefix_and_length() {
        let outpoint = Outpoint::new(TxHash([1u8; 32]), 7);
        let key = coin_key(&outpoint);
        assert_eq!(key[0], COIN);
        // 1 prefix byte + 32 hash bytes + 1 varint byte for index 7.
        assert_eq!(key.len(), 34);
    }

    #[test]
    fn address_key_is_21_bytes() {
        let address = Address::key_hash([9u8; 20]);
        let key = address_key(&address);
        assert_eq!(key.len(), 21);
        assert_eq!(key[0], ADDRESS);
    }
}
