//! Outpoints and coins.

use serde::{Deserialize, Serialize};

use crate::compactint::CompactInt;
use crate::destination::Script;
use crate::hash::TxHash;
use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, Result};

/// A reference to a specific output of a specific transaction.
///
/// Wire/disk layout: 32-byte tx hash followed by a varint output index,
/// matching the coin database key's tail. The index is varint rather than
/// fixed-width, so this type serializes by hand instead of via the
/// `BtcSerialize` derive (which would encode `index` as a fixed `u32`).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "proptest-impl", derive(proptest_derive::Arbitrary))]
pub struct Outpoint {
    pub hash: TxHash,
    pub index: u32,
}

impl Outpoint {
    pub fn new(hash: TxHash, index: u32) -> Self {
        Outpoint { hash, index }
    }
}

impl BitcoinSerialize for Outpoint {
    fn bitcoin_serialize<W: std::io::Write>(&self, mut target: W) -> std::io::Result<()> {
        self.hash.bitcoin_serialize(&mut target)?;
        CompactInt::from(self.index as usize).bitcoin_serialize(&mut target)
    }
}

impl BitcoinDeserialize for Outpoint {
    fn bitcoin_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self> {
        let hash = TxHash::bitcoin_deserialize(&mut reader)?;
        let index = CompactInt::bitcoin_deserialize(&mut reader)?.value() as u32;
        Ok(Outpoint { hash, index })
    }
}

/// A currently-live output plus the provenance needed to validate a spend of
/// it and to undo the effect of its creation on reorg.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// The output's value, in the smallest on-chain unit.
    pub amount: i64,
    /// The output's spending condition.
    pub script: Script,
    /// The height of the block that created this coin.
    pub height: u64,
    /// Whether this coin was created by a coinbase transaction.
    pub is_coinbase: bool,
    /// Whether a subsequent transaction has spent this coin. Spent coins are
    /// never written to durable storage; the flag exists so the in-memory
    /// cache can represent a pending spend before it is flushed.
    pub is_spent: bool,
}

impl Coin {
    pub fn new(amount: i64, script: Script, height: u64, is_coinbase: bool) -> Self {
        Coin {
            amount,
            script,
            height,
            is_coinbase,
            is_spent: false,
        }
    }

    pub fn spend(&mut self) {
        self.is_spent = true;
    }
}

impl BitcoinSerialize for Coin {
    fn bitcoin_serialize<W: std::io::Write>(&self, mut target: W) -> std::io::Result<()> {
        CompactInt::from(self.height as usize).bitcoin_serialize(&mut target)?;
        self.is_coinbase.bitcoin_serialize(&mut target)?;
        self.amount.bitcoin_serialize(&mut target)?;
        self.script.bitcoin_serialize(&mut target)?;
        Ok(())
    }
}

impl BitcoinDeserialize for Coin {
    fn bitcoin_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self> {
        let height = CompactInt::bitcoin_deserialize(&mut reader)?.value();
        let is_coinbase = bool::bitcoin_deserialize(&mut reader)?;
        let amount = i64::bitcoin_deserialize(&mut reader)?;
        let script = Script::bitcoin_deserialize(&mut reader)?;
        Ok(Coin {
            amount,
            script,
            height,
            is_coinbase,
            is_spent: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn coin_roundtrip() {
        let coin = Coin::new(5_000_000_000, Script(vec![0x76, 0xa9, 0x14]), 0, true);
        let bytes = coin.bitcoin_serialize_to_vec().unwrap();
        let back = Coin::bitcoin_deserialize(Cursor::new(bytes)).unwrap();
        assert_eq!(coin.amount, back.amount);
        assert_eq!(coin.script, back.script);
        assert_eq!(coin.height, back.height);
        assert_eq!(coin.is_coinbase, back.is_coinbase);
        assert!(!back.is_spent);
    }

    #[test]
    fn outpoint_roundtrip() {
        let op = Outpoint::new(TxHash([7u8; 32]), 3);
        let bytes = op.bitcoin_serialize_to_vec().unwrap();
        let back = Outpoint::bitcoin_deserialize(Cursor::new(bytes)).unwrap();
        assert_eq!(op, back);
    }
}
