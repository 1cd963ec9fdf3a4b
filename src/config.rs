//! Construction-time configuration of the index.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported while validating a [`TreeOptions`].
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("leaf_capacity {0} is not a multiple of piece_size {1}")]
    PieceSize(usize, usize),
    #[error("leaf_capacity {0} is not a multiple of probe_size {1}")]
    ProbeSize(usize, usize),
    #[error("fill ratio {0} outside (0, 1]")]
    FillRatio(f64),
    #[error("morph thresholds ({0}, {1}) must satisfy low < high <= 64")]
    MorphThresholds(u32, u32),
    #[error("epsilon must be at least 1")]
    Epsilon,
}

/// Tuning knobs consumed once at construction.
///
/// The defaults reproduce the profile the index was developed against:
/// 1280-record leaves, 128-record sort pieces, 16-slot probe buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Enable adaptive leaf layouts. When false, leaves keep the layout they
    /// were created with forever.
    pub morphing_enabled: bool,
    /// Per-leaf record capacity.
    pub leaf_capacity: usize,
    /// Width of a sorted piece in the write-optimized leaf log.
    pub piece_size: usize,
    /// Bucket probe size of the read-optimized leaf.
    pub probe_size: usize,
    /// Error bound of the piecewise-linear segmentation used for bulk-load
    /// leaf boundaries.
    pub epsilon_leaf: u64,
    /// Error bound of the segmentation used when building inner layers.
    pub epsilon_inner: u64,
    /// Target fill after bulk load and after a split.
    pub initial_fill_ratio: f64,
    /// Fill level at which a read-optimized leaf must split.
    pub max_fill_ratio: f64,
    /// Overflow share past which a node stops growing in place: an inner
    /// node rebuilds, a read-optimized leaf splits early to retrain its
    /// model.
    pub overflow_max_ratio: f64,
    /// `(low, high)` popcount bounds of the 64-bit access history. At or
    /// below `low` a write-optimized leaf morphs to read-optimized; at or
    /// above `high` the reverse.
    pub morph_thresholds: (u32, u32),
    /// Queue morph work to a background worker instead of running it inline.
    pub background_morph: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        TreeOptions {
            morphing_enabled: true,
            leaf_capacity: 1280,
            piece_size: 128,
            probe_size: 16,
            epsilon_leaf: 64,
            epsilon_inner: 8,
            initial_fill_ratio: 0.6,
            max_fill_ratio: 0.9,
            overflow_max_ratio: 0.3,
            morph_thresholds: (44, 56),
            background_morph: false,
        }
    }
}

impl TreeOptions {
    /// A profile with larger leaves, matching the big-node configuration of
    /// the original benchmarks.
    pub fn large_leaves() -> Self {
        TreeOptions {
            leaf_capacity: 10240,
            piece_size: 1024,
            ..TreeOptions::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.piece_size == 0 || self.leaf_capacity % self.piece_size != 0 {
            return Err(ConfigError::PieceSize(self.leaf_capacity, self.piece_size));
        }
        if self.probe_size == 0 || self.leaf_capacity % self.probe_size != 0 {
            return Err(ConfigError::ProbeSize(self.leaf_capacity, self.probe_size));
        }
        for ratio in [
            self.initial_fill_ratio,
            self.max_fill_ratio,
            self.overflow_max_ratio,
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::FillRatio(ratio));
            }
        }
        let (low, high) = self.morph_thresholds;
        if low >= high || high > 64 {
            return Err(ConfigError::MorphThresholds(low, high));
        }
        if self.epsilon_leaf == 0 || self.epsilon_inner == 0 {
            return Err(ConfigError::Epsilon);
        }
        Ok(())
    }

    /// Record count at which a freshly filled leaf is considered full enough.
    pub(crate) fn initial_fill(&self) -> usize {
        ((self.leaf_capacity as f64 * self.initial_fill_ratio) as usize).max(1)
    }

    /// Record count at which a read-optimized leaf requests a split.
    pub(crate) fn split_threshold(&self) -> usize {
        ((self.leaf_capacity as f64 * self.max_fill_ratio) as usize).max(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        assert_eq!(TreeOptions::default().validate(), Ok(()));
        assert_eq!(TreeOptions::large_leaves().validate(), Ok(()));
    }

    #[test]
    fn bad_piece_size_is_rejected() {
        let opts = TreeOptions {
            piece_size: 7,
            ..TreeOptions::default()
        };
        assert_eq!(opts.validate(), Err(ConfigError::PieceSize(1280, 7)));
    }

    #[test]
    fn bad_thresholds_are_rejected() {
        let opts = TreeOptions {
            morph_thresholds: (56, 44),
            ..TreeOptions::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::MorphThresholds(56, 44))
        ));
    }

    #[test]
    fn fill_ratio_bounds() {
        let opts = TreeOptions {
            max_fill_ratio: 0.0,
            ..TreeOptions::default()
        };
        assert!(matches!(opts.validate(), Err(ConfigError::FillRatio(_))));
    }
}
