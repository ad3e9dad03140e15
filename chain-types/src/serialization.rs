//! Consensus-critical serialization.
//!
//! This module contains two traits, `BitcoinSerialize` and `BitcoinDeserialize`,
//! analogs of the Serde `Serialize`/`Deserialize` traits but intended for the
//! fixed, on-disk and on-wire formats this crate's types must round-trip
//! exactly, bit for bit.
//!
//! `BitcoinSerialize` returns a plain `std::io::Error` (writes only fail on
//! I/O), matching the signature the `BtcSerialize` derive macro emits;
//! `BitcoinDeserialize` returns `SerializationError`, since deserialization
//! can also fail on malformed input.

mod deserialize;
mod error;

pub mod sha256d;

use chrono::{DateTime, Utc};
use std::convert::TryFrom;

pub use deserialize::{BitcoinDeserialize, BitcoinDeserializeInto};
pub use error::SerializationError;

use crate::compactint::CompactInt;
use byteorder::{LittleEndian, WriteBytesExt};

pub type Result<T> = std::result::Result<T, SerializationError>;

pub trait BitcoinSerialize {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> std::io::Result<()>;

    fn bitcoin_serialize_to_vec(&self) -> std::io::Result<Vec<u8>> {
        let mut data = Vec::new();
        self.bitcoin_serialize(&mut data)?;
        Ok(data)
    }
}

impl BitcoinSerialize for bool {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        target.write_all(&[*self as u8])
    }
}

impl BitcoinSerialize for &u8 {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        target.write_all(&[**self])
    }
}

impl BitcoinSerialize for u16 {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        target.write_u16::<LittleEndian>(*self)
    }
}

impl BitcoinSerialize for u32 {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        target.write_u32::<LittleEndian>(*self)
    }
}

impl BitcoinSerialize for i32 {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        target.write_i32::<LittleEndian>(*self)
    }
}

impl BitcoinSerialize for u64 {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        target.write_u64::<LittleEndian>(*self)
    }
}

impl BitcoinSerialize for i64 {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        target.write_i64::<LittleEndian>(*self)
    }
}

impl BitcoinSerialize for DateTime<Utc> {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        let time_u32 = u32::try_from(self.timestamp()).unwrap_or(std::u32::MAX);
        target.write_u32::<LittleEndian>(time_u32)
    }
}

impl BitcoinSerialize for [u8; 4] {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        target.write_all(self)
    }
}

impl BitcoinSerialize for [u8; 20] {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        target.write_all(self)
    }
}

impl BitcoinSerialize for [u8; 32] {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        target.write_all(self)
    }
}

impl BitcoinSerialize for Vec<u8> {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        CompactInt::from(self.len()).bitcoin_serialize(&mut target)?;
        target.write_all(self)?;
        Ok(())
    }
}

impl<T> BitcoinSerialize for Vec<T>
where
    T: BitcoinSerialize,
{
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        CompactInt::from(self.len()).bitcoin_serialize(&mut target)?;
        for item in self.iter() {
            item.bitcoin_serialize(&mut target)?
        }
        Ok(())
    }
}

impl<T, U> BitcoinSerialize for (T, U)
where
    T: BitcoinSerialize,
    U: BitcoinSerialize,
{
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        self.0.bitcoin_serialize(&mut target)?;
        self.1.bitcoin_serialize(&mut target)?;
        Ok(())
    }
}

impl<T: BitcoinSerialize> BitcoinSerialize for Option<T> {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        match self {
            Some(contents) => contents.bitcoin_serialize(&mut target),
            None => Ok(()),
        }
    }
}
