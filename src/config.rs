//! Runtime configuration for hotswap-cache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every tier budget, the codec choice, extraction knobs and the cold store
//! location live here.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache::compressor::Codec;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "hotswap-cache",
    version,
    about = "Maintenance tool for hotswap-cache containers and configuration"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Encode a file into a compression container.
    Compress {
        input: PathBuf,
        output: PathBuf,
        /// Codec override (none, lz4, lz4_hc, zstd, zstd_fast).
        #[arg(long)]
        codec: Option<Codec>,
        /// Level override (0 = codec default).
        #[arg(long)]
        level: Option<i32>,
    },

    /// Decode a container back into the original bytes.
    Decompress { input: PathBuf, output: PathBuf },

    /// Print the container header of a file.
    Inspect { input: PathBuf },

    /// List codecs and whether each is usable.
    Codecs,

    /// Print the effective configuration as JSON.
    ShowConfig,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tensor_cache: TensorCacheConfig,
    pub hot_cache: HotCacheConfig,
    pub residency: ResidencyConfig,
    pub compression: CompressionConfig,
    pub extraction: ExtractionConfig,
    pub store: StoreConfig,
}

/// Page-aligned tensor buffer tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorCacheConfig {
    pub budget_bytes: usize,
}

impl Default for TensorCacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 2 * 1024 * 1024 * 1024, // 2 GB
        }
    }
}

/// Prefetch-only RAM tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotCacheConfig {
    pub budget_bytes: usize,
}

impl Default for HotCacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 2 * 1024 * 1024 * 1024, // 2 GB
        }
    }
}

/// Device memory budget for whole loaded models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    pub budget_bytes: usize,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 7000 * 1024 * 1024, // ~7 GB usable VRAM
        }
    }
}

/// Codec selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub codec: Codec,

    /// Codec level; 0 picks the codec default.
    pub level: i32,

    /// Codecs treated as unavailable even though they are built in.
    pub disabled_codecs: Vec<Codec>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Lz4,
            level: 0,
            disabled_codecs: Vec::new(),
        }
    }
}

/// Prefill and snapshot settings for state extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Sequence slot to prefill and snapshot.
    pub sequence_id: i32,

    /// Tokens per decode batch during prefill.
    pub batch_size: usize,

    /// Prepend the beginning-of-sequence token when tokenizing text.
    pub add_bos: bool,

    /// Log prefill progress every this many tokens (0 = never).
    pub progress_interval_tokens: usize,

    /// Checked between prefill batches.
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            sequence_id: 0,
            batch_size: 512,
            add_bos: true,
            progress_interval_tokens: 4096,
            cancel: None,
        }
    }
}

/// On-disk cold tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,

    /// Maximum bytes on disk (0 = unlimited).
    pub capacity_bytes: u64,

    pub compression: CompressionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/hotswap-cache"),
            capacity_bytes: 64 * 1024 * 1024 * 1024, // 64 GB
            compression: CompressionConfig {
                codec: Codec::Zstd,
                level: 3,
                disabled_codecs: Vec::new(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.extraction.batch_size == 0 {
            anyhow::bail!("extraction.batch_size must be at least 1");
        }
        if self.tensor_cache.budget_bytes == 0 || self.hot_cache.budget_bytes == 0 {
            anyhow::bail!("cache budgets must be non-zero");
        }
        Ok(())
    }
}
