//! Scripts, addresses, and the tagged result of extracting a spending
//! destination from a script. Destinations are a closed, tagged enum rather
//! than a trait object so every caller can match on the kinds it cares
//! about without dynamic dispatch.

use std::fmt;
use std::io;

use ripemd160::{Digest as _, Ripemd160};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::compactint::CompactInt;
use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, Result, SerializationError};

/// An opaque, unparsed spending condition attached to an output.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Hash)]
#[cfg_attr(feature = "proptest-impl", derive(proptest_derive::Arbitrary))]
pub struct Script(pub Vec<u8>);

impl Script {
    pub fn serialized_size(&self) -> usize {
        CompactInt::size(self.0.len()) + self.0.len()
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Script").field(&hex::encode(&self.0)).finish()
    }
}

impl BitcoinSerialize for Script {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> std::io::Result<()> {
        CompactInt::from(self.0.len()).bitcoin_serialize(&mut writer)?;
        writer.write_all(&self.0[..])
    }
}

impl BitcoinDeserialize for Script {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self> {
        let len = CompactInt::bitcoin_deserialize(&mut reader)?.value();
        let mut bytes = Vec::new();
        io::Read::take(reader.by_ref(), len).read_to_end(&mut bytes)?;
        Ok(Script(bytes))
    }
}

/// 20-byte key-hash or script-hash address, Base58Check-encoded for display.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Address {
    version: u8,
    payload: [u8; 20],
}

mod magic {
    pub const P2PKH: u8 = 0x00;
    pub const P2SH: u8 = 0x05;
}

impl Address {
    pub fn key_hash(payload: [u8; 20]) -> Self {
        Address {
            version: magic::P2PKH,
            payload,
        }
    }

    pub fn script_hash(payload: [u8; 20]) -> Self {
        Address {
            version: magic::P2SH,
            payload,
        }
    }

    pub fn is_key_hash(&self) -> bool {
        self.version == magic::P2PKH
    }

    pub fn payload(&self) -> &[u8; 20] {
        &self.payload
    }

    /// The address hash used as the key tail for the address-to-coins index.
    fn hash_payload(bytes: &[u8]) -> [u8; 20] {
        let sha = Sha256::digest(bytes);
        let ripe = Ripemd160::digest(&sha);
        let mut out = [0u8; 20];
        out.copy_from_slice(&ripe);
        out
    }

    pub fn from_script_bytes(script: &[u8]) -> Self {
        Address::script_hash(Self::hash_payload(script))
    }

    pub fn from_pubkey_bytes(pubkey: &[u8]) -> Self {
        Address::key_hash(Self::hash_payload(pubkey))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Address")
            .field("kind", &if self.is_key_hash() { "p2pkh" } else { "p2sh" })
            .field("payload", &hex::encode(self.payload))
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut bytes = Vec::with_capacity(21);
        bytes.push(self.version);
        bytes.extend_from_slice(&self.payload);
        f.write_str(&bs58::encode(bytes).with_check().into_string())
    }
}

impl std::str::FromStr for Address {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|_| SerializationError::Parse("address decoding error"))?;
        if bytes.len() != 21 {
            return Err(SerializationError::Parse("address wrong length"));
        }
        let mut payload = [0u8; 20];
        payload.copy_from_slice(&bytes[1..]);
        match bytes[0] {
            magic::P2PKH => Ok(Address::key_hash(payload)),
            magic::P2SH => Ok(Address::script_hash(payload)),
            _ => Err(SerializationError::Parse("unknown address version")),
        }
    }
}

impl BitcoinSerialize for Address {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[self.version])?;
        writer.write_all(&self.payload)
    }
}

impl BitcoinDeserialize for Address {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self> {
        let version = u8::bitcoin_deserialize(&mut reader)?;
        let payload = <[u8; 20]>::bitcoin_deserialize(&mut reader)?;
        match version {
            magic::P2PKH => Ok(Address::key_hash(payload)),
            magic::P2SH => Ok(Address::script_hash(payload)),
            _ => Err(SerializationError::Parse("unknown address version")),
        }
    }
}

/// The result of extracting a spending destination from a script. The
/// address index and contract state store pattern-match on this tag instead
/// of dispatching on a trait object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    /// A simple pay-to-key-hash output; the only kind the address index
    /// tracks.
    KeyHash(Address),
    /// A pay-to-script-hash output; the address index does not track these.
    ScriptHash(Address),
    /// An output whose script invokes contract code; consumed by the
    /// contract state store.
    Contract { contract_id: [u8; 20] },
    /// An output that moves value to another branch/sidechain.
    BranchTransfer { target_branch: u32 },
    /// A script this layer cannot or need not interpret further. The
    /// address index and coinbase detection both treat this as "not a
    /// key-hash address".
    Unresolved,
}

impl Destination {
    pub fn is_simple_key_hash(&self) -> bool {
        matches!(self, Destination::KeyHash(_))
    }

    pub fn key_hash_address(&self) -> Option<&Address> {
        match self {
            Destination::KeyHash(addr) => Some(addr),
            _ => None,
        }
    }
}

/// A caller-supplied function extracting a [`Destination`] from a script.
/// The interpreter that actually evaluates scripts lives in the
/// script-execution crate; this layer only consumes the tagged result.
pub type DestinationResolver = fn(&Script) -> Destination;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn script_roundtrip() {
        let script = Script(vec![0x76, 0xa9, 0x14, 0, 0, 0]);
        let bytes = script.bitcoin_serialize_to_vec().unwrap();
        let back = Script::bitcoin_deserialize(Cursor::new(bytes)).unwrap();
        assert_eq!(script, back);
    }

    #[test]
    fn address_roundtrip_via_display() {
        let addr = Address::from_pubkey_bytes(b"some-fake-pubkey-bytes-0000000000");
        let s = format!("{}", addr);
        let parsed: Address = s.parse().unwrap();
        assert_eq!(addr, parsed);
        assert!(parsed.is_key_hash());
    }

    #[test]
    fn script_hash_is_not_key_hash() {
        let addr = Address::from_script_bytes(&[0u8; 20]);
        assert!(!addr.is_key_hash());
    }
}
