//! The Key-Value Backend: a persistent ordered map from opaque byte keys to
//! opaque byte values, with atomic batched writes, forward iteration, range
//! compaction, and size estimation. This is a thin trait boundary over
//! RocksDB; every other component in this crate is written against
//! [`KeyValueBackend`] rather than against RocksDB directly so that CV,
//! AddrIdx, BIS and CSS tests can swap in a throwaway store.

pub mod keys;
mod rocks;

pub use rocks::{RocksBackend, RocksBatch};

use crate::error::Result;

/// An accumulator of puts and deletes, applied atomically by
/// [`KeyValueBackend::write_batch`].
pub trait WriteBatch {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
    /// An estimate of the batch's serialized size, used by flush loops to
    /// decide when to write the batch out and start a new one.
    fn size_in_bytes(&self) -> usize;
    fn clear(&mut self);
    fn is_empty(&self) -> bool {
        self.size_in_bytes() == 0
    }
}

pub trait KeyValueBackend {
    type Batch: WriteBatch + Default;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn new_batch(&self) -> Self::Batch;
    fn write_batch(&self, batch: Self::Batch, sync: bool) -> Result<()>;

    /// A forward-only iterator over every key at or after `start`, as of the
    /// moment this call was made: later writes are not observed by an
    /// iterator already in progress.
    fn iter_from<'a>(
        &'a self,
        start: &[u8],
    ) -> Box<dyn Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a>;

    /// A forward-only iterator over every key with the given prefix.
    fn iter_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a> {
        let prefix = prefix.to_vec();
        Box::new(
            self.iter_from(&prefix)
                .take_while(move |(key, _)| key.starts_with(&prefix)),
        )
    }

    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>);

    /// An approximate count of live bytes stored in `[begin_prefix,
    /// end_prefix)`. Backends that cannot compute an exact range estimate
    /// may return a whole-database approximation.
    fn estimate_size(&self, begin_prefix: &[u8], end_prefix: &[u8]) -> u64;
}
