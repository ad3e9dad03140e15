//! Block headers and heights.

use bitcoin_serde_derive::{BtcDeserialize, BtcSerialize};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cached::Cached;
use crate::hash::BlockHash;
use crate::serialization::{BitcoinDeserialize, BitcoinSerialize};

/// A block's distance from the genesis block. Genesis is height 0.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "proptest-impl", derive(proptest_derive::Arbitrary))]
pub struct BlockHeight(pub u32);

impl BlockHeight {
    pub const fn new(height: u32) -> Self {
        BlockHeight(height)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Self {
        BlockHeight(self.0 + 1)
    }

    pub fn previous(&self) -> Option<Self> {
        self.0.checked_sub(1).map(BlockHeight)
    }
}

impl BitcoinSerialize for BlockHeight {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> std::io::Result<()> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for BlockHeight {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> crate::serialization::Result<Self> {
        Ok(BlockHeight(u32::bitcoin_deserialize(reader)?))
    }
}

impl std::fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block header: the 80-byte-equivalent record chaining each block to its
/// parent and binding it to its transaction set via a Merkle root. Block
/// validation, difficulty checks and proof-of-work are handled elsewhere;
/// this crate only stores and retrieves headers by hash and height.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, BtcSerialize, BtcDeserialize)]
pub struct Header {
    pub version: u32,

    /// The hash of the previous block; `BlockHash::default()` for genesis.
    pub previous_block_hash: BlockHash,

    /// The root of the block's transaction Merkle tree.
    pub merkle_root: crate::merkle::Root,

    /// Unix epoch time (UTC) the header claims to have been mined at.
    pub time: DateTime<Utc>,

    /// Encoded PoW target threshold, in Bitcoin's nBits format. Opaque to
    /// this layer: difficulty checks are an external collaborator's job.
    pub bits: u32,

    pub nonce: u32,

    /// Cached so repeated hashing (e.g. on every BIS lookup) is free after
    /// the first call. Not part of the wire encoding.
    hash: Cached<BlockHash>,
}

impl Header {
    pub fn new(
        version: u32,
        previous_block_hash: BlockHash,
        merkle_root: crate::merkle::Root,
        time: DateTime<Utc>,
        bits: u32,
        nonce: u32,
    ) -> Header {
        Header {
            version,
            previous_block_hash,
            merkle_root,
            time,
            bits,
            nonce,
            hash: Cached::new(),
        }
    }

    /// Returns this header's hash, computing and caching it on first call.
    pub fn hash(&mut self) -> BlockHash {
        if let Some(hash) = self.hash.value() {
            return hash;
        }
        let hash = BlockHash::from(&*self);
        *self.hash.mut_value() = Some(hash);
        hash
    }

    /// Returns this header's hash without mutating the cache.
    pub fn hash_uncached(&self) -> BlockHash {
        BlockHash::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle;
    use std::io::Cursor;

    fn sample_header() -> Header {
        Header::new(
            1,
            BlockHash::default(),
            merkle::Root::from_bytes_exact([3u8; 32]),
            Utc::now(),
            0x1d00ffff,
            42,
        )
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let bytes = header.bitcoin_serialize_to_vec().unwrap();
        let back = Header::bitcoin_deserialize(Cursor::new(bytes)).unwrap();
        assert_eq!(header.version, back.version);
        assert_eq!(header.previous_block_hash, back.previous_block_hash);
        assert_eq!(header.merkle_root, back.merkle_root);
        assert_eq!(header.bits, back.bits);
        assert_eq!(header.nonce, back.nonce);
    }

    #[test]
    fn hash_is_stable_and_cached() {
        let mut header = sample_header();
        let first = header.hash();
        let second = header.hash();
        assert_eq!(first, second);
        assert_eq!(first, header.hash_uncached());
    }

    #[test]
    fn height_arithmetic() {
        let genesis = BlockHeight::new(0);
        assert!(genesis.previous().is_none());
        assert_eq!(genesis.next(), BlockHeight::new(1));
    }
}
