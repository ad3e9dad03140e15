//! 32-byte double-SHA256 identifiers.
//!
//! Transaction hashes and block hashes are both 32-byte SHA256d digests, but
//! mixing them up is a classic source of bugs (an outpoint's `hash` field is
//! a transaction hash, never a block hash). We keep them as distinct
//! newtypes rather than a single shared `Hash([u8; 32])`.

use std::fmt;

use bitcoin_serde_derive::BtcSerialize;
use serde::{Deserialize, Serialize};

use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, Result, SerializationError};

macro_rules! hash_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, BtcSerialize)]
        #[cfg_attr(feature = "proptest-impl", derive(proptest_derive::Arbitrary))]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const fn from_bytes_exact(bytes: [u8; 32]) -> $name {
                $name(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name([0u8; 32])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                // Displayed big-endian, following the u256 convention Bitcoin
                // uses for block and transaction hashes.
                let mut reversed_bytes = self.0;
                reversed_bytes.reverse();
                f.write_str(&hex::encode(&reversed_bytes))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let mut reversed_bytes = self.0;
                reversed_bytes.reverse();
                f.debug_tuple(stringify!($name))
                    .field(&hex::encode(&reversed_bytes))
                    .finish()
            }
        }

        impl BitcoinDeserialize for $name {
            fn bitcoin_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self> {
                Ok($name(<[u8; 32]>::bitcoin_deserialize(&mut reader)?))
            }
        }

        impl std::str::FromStr for $name {
            type Err = SerializationError;

            fn from_str(s: &str) -> Result<Self> {
                let mut bytes = [0; 32];
                if hex::decode_to_slice(s, &mut bytes[..]).is_err() {
                    return Err(SerializationError::Parse("hex decoding error"));
                }
                bytes.reverse();
                Ok($name(bytes))
            }
        }
    };
}

hash_type!(TxHash, "The (SHA256d) hash of a transaction.");
hash_type!(
    BlockHash,
    "The (SHA256d) hash of a block header; identifies a block and its position in the chain."
);

impl<'a> From<&'a crate::header::Header> for BlockHash {
    fn from(header: &'a crate::header::Header) -> Self {
        let mut hash_writer = crate::serialization::sha256d::Writer::default();
        header
            .bitcoin_serialize(&mut hash_writer)
            .expect("Sha256dWriter is infallible");
        BlockHash(hash_writer.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let hash = TxHash(bytes);
        let s = format!("{}", hash);
        let parsed: TxHash = s.parse().unwrap();
        assert_eq!(hash, parsed);
    }
}
