//! Startup configuration for the chain-state persistence layer.
//!
//! Mirrors the teacher's `zebra_state::Config`: a plain struct read once at
//! startup, with no live reload. The node daemon (out of scope here) is
//! expected to load this from TOML via `serde`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default size, in bytes, at which an in-progress flush batch is written to
/// the key-value backend and cleared.
pub const DEFAULT_DB_BATCH_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The base directory under which `chainstate/`, `blocks/index/` and
    /// `contract/` are created.
    pub cache_dir: PathBuf,

    /// Bytes at which a flush batch is written and cleared (`dbbatchsize`).
    pub db_batch_size: usize,

    /// Abort the process with probability `1/db_crash_ratio` after each
    /// partial flush, for crash-consistency testing. `0` disables the
    /// fault-injection hook entirely.
    pub db_crash_ratio: u32,

    /// Per-store block-cache size, in megabytes, passed to the key-value
    /// backend (`dbcache`).
    pub db_cache_mb: usize,

    /// Force a full reindex of the block-index store on next startup.
    pub reindex: bool,

    /// Maintain the `t`-prefixed transaction-position index.
    pub tx_index: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("magnachain"),
            db_batch_size: DEFAULT_DB_BATCH_SIZE,
            db_crash_ratio: 0,
            db_cache_mb: 128,
            reindex: false,
            tx_index: false,
        }
    }
}

impl Config {
    pub fn coin_db_path(&self) -> PathBuf {
        self.cache_dir.join("chainstate")
    }

    pub fn block_index_path(&self) -> PathBuf {
        self.cache_dir.join("blocks").join("index")
    }

    pub fn contract_db_path(&self) -> PathBuf {
        self.cache_dir.join("contract")
    }

    /// Rooted at an arbitrary directory, for tests that want an isolated
    /// throwaway database rather than the platform cache directory.
    pub fn ephemeral(base: impl AsRef<Path>) -> Self {
        Config {
            cache_dir: base.as_ref().to_path_buf(),
            ..Config::default()
        }
    }
}
