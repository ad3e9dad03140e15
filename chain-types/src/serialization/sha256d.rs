//! Double-SHA256, Bitcoin's standard hashing construction for block and
//! transaction identifiers.

use sha2::{Digest, Sha256};

/// An `io::Write` implementation that hashes everything written to it with
/// SHA256d (`SHA256(SHA256(data))`), without buffering the data itself.
///
/// Used to compute block hashes directly from a header's serialized bytes,
/// as `From<&Header> for BlockHash` does.
pub struct Writer(Sha256);

impl Default for Writer {
    fn default() -> Self {
        Writer(Sha256::new())
    }
}

impl std::io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Writer {
    /// Finish hashing and return the double-SHA256 digest.
    pub fn finish(self) -> [u8; 32] {
        let first = self.0.finalize();
        let second = Sha256::digest(&first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        out
    }
}

/// One-shot SHA256d over a byte slice.
pub fn hash(bytes: &[u8]) -> [u8; 32] {
    let mut w = Writer::default();
    std::io::Write::write_all(&mut w, bytes).expect("writing to a hasher is infallible");
    w.finish()
}
