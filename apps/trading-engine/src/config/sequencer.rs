//! Sequence generator configuration.

use serde::{Deserialize, Serialize};

/// Settings for the monotonic request-sequence generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// How far ahead of the last issued value the durable watermark is
    /// written. Larger strides mean fewer checkpoint writes and a larger
    /// gap after restart.
    #[serde(default = "default_checkpoint_stride")]
    pub checkpoint_stride: u64,
    /// Length of the startup warm-up window during which the burst limiter
    /// applies, in seconds. Zero disables the limiter.
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,
    /// Maximum `next()` calls per second inside the warm-up window.
    #[serde(default = "default_warmup_max_per_sec")]
    pub warmup_max_calls_per_sec: u32,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            checkpoint_stride: default_checkpoint_stride(),
            warmup_secs: default_warmup_secs(),
            warmup_max_calls_per_sec: default_warmup_max_per_sec(),
        }
    }
}

const fn default_checkpoint_stride() -> u64 {
    128
}

const fn default_warmup_secs() -> u64 {
    30
}

const fn default_warmup_max_per_sec() -> u32 {
    5
}
