//! Status bitmask for a [`super::BlockRecord`] (§3 `BlockRecord.status`).

bitflags::bitflags! {
    /// Mirrors the status bits a real block-index record carries: whether
    /// the body/undo data are on disk, and how far through validation the
    /// block (out of scope here) got. This layer only stores and returns
    /// these bits; setting them in response to validation results is the
    /// block-validation layer's job.
    pub struct BlockStatus: u32 {
        /// The block body is present in `blocks/blkNNNNN.dat`.
        const HAVE_DATA = 0b0000_0001;
        /// Undo data for this block is present in `blocks/revNNNNN.dat`.
        const HAVE_UNDO = 0b0000_0010;
        /// The header passed the checks a header can be validated with
        /// alone (format, proof-of-work format).
        const VALID_HEADER = 0b0000_0100;
        /// The block's transactions passed context-free checks.
        const VALID_TRANSACTIONS = 0b0000_1000;
        /// The block's ancestors are all valid up to genesis.
        const VALID_CHAIN = 0b0001_0000;
        /// Every script in the block's transactions has been checked.
        const VALID_SCRIPTS = 0b0010_0000;
        /// This block itself failed validation.
        const FAILED_VALID = 0b0100_0000;
        /// An ancestor of this block failed validation.
        const FAILED_CHILD = 0b1000_0000;
    }
}

impl Default for BlockStatus {
    fn default() -> Self {
        BlockStatus::empty()
    }
}
