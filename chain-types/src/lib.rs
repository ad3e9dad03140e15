//! Value types shared between the chain-state persistence layer and its
//! callers: outpoints, coins, script destinations, block headers, and the
//! wire/disk encoding traits they round-trip through.
//!
//! This crate intentionally has no notion of a full transaction, script
//! interpreter, or network message — those belong to the block-validation
//! and P2P layers, which this workspace treats as external collaborators.

pub mod cached;
pub mod compactint;
pub mod destination;
pub mod hash;
pub mod header;
pub mod merkle;
pub mod outpoint;
pub mod serialization;

pub use cached::Cached;
pub use compactint::CompactInt;
pub use destination::{Address, Destination, DestinationResolver, Script};
pub use hash::{BlockHash, TxHash};
pub use header::{BlockHeight, Header};
pub use outpoint::{Coin, Outpoint};
pub use serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};
