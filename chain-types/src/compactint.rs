use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, Result};
use byteorder::{LittleEndian, WriteBytesExt};

/// Bitcoin's variable-length integer encoding, used as a length prefix for
/// every variable-sized field this crate serializes (scripts, address
/// lists, outpoint vectors, ...), and for an outpoint's output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactInt(u64);

impl CompactInt {
    pub fn new() -> CompactInt {
        CompactInt(0)
    }

    pub fn from(value: usize) -> CompactInt {
        CompactInt(value as u64)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn size(value: usize) -> usize {
        if value < 253 {
            1
        } else if value < std::u16::MAX as usize {
            3
        } else if value < std::u32::MAX as usize {
            5
        } else {
            9
        }
    }
}

impl Default for CompactInt {
    fn default() -> Self {
        CompactInt::new()
    }
}

impl BitcoinSerialize for CompactInt {
    fn bitcoin_serialize<W>(&self, mut target: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        if self.value() < 253 {
            target.write_all(&[self.value() as u8])?;
        } else if self.value() <= std::u16::MAX as u64 {
            target.write_all(&[253])?;
            target.write_u16::<LittleEndian>(self.value() as u16)?;
        } else if self.value() <= std::u32::MAX as u64 {
            target.write_all(&[254])?;
            target.write_u32::<LittleEndian>(self.value() as u32)?;
        } else {
            target.write_all(&[255])?;
            target.write_u64::<LittleEndian>(self.value())?;
        }
        Ok(())
    }
}

impl BitcoinDeserialize for CompactInt {
    fn bitcoin_deserialize<R: std::io::Read>(mut target: R) -> Result<CompactInt> {
        let first = u8::bitcoin_deserialize(&mut target)?;
        if first < 253 {
            Ok(CompactInt::from(first as usize))
        } else if first == 253 {
            Ok(CompactInt::from(
                u16::bitcoin_deserialize(&mut target)? as usize,
            ))
        } else if first == 254 {
            Ok(CompactInt::from(
                u32::bitcoin_deserialize(&mut target)? as usize,
            ))
        } else {
            Ok(CompactInt(u64::bitcoin_deserialize(&mut target)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_small() {
        for v in [0usize, 1, 100, 252] {
            let c = CompactInt::from(v);
            let bytes = c.bitcoin_serialize_to_vec().unwrap();
            assert_eq!(bytes.len(), CompactInt::size(v));
            let back = CompactInt::bitcoin_deserialize(Cursor::new(bytes)).unwrap();
            assert_eq!(back.value(), v as u64);
        }
    }

    #[test]
    fn roundtrip_boundaries() {
        for v in [253usize, 254, 255, 65535, 65536, 4294967295] {
            let c = CompactInt::from(v);
            let bytes = c.bitcoin_serialize_to_vec().unwrap();
            let back = CompactInt::bitcoin_deserialize(Cursor::new(bytes)).unwrap();
            assert_eq!(back.value(), v as u64);
        }
    }
}
