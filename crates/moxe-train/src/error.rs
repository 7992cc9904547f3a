//! Error types for MoE loss aggregation and mesh-parallel stepping.
//!
//! Errors fall into three severities:
//! - configuration problems, reported before the first step runs;
//! - degenerate inputs, which only invalidate a single loss term;
//! - numerical and collective failures, which halt the whole mesh.

use thiserror::Error;

use crate::router_loss::LossKind;

/// Main error type for moxe operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MoxeError {
    /// Malformed mesh, out-of-range layer index, missing teacher, bad coefficients.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A loss term could not be computed from its inputs (e.g. zero routed tokens).
    #[error("Degenerate input for {kind} at {}: {reason}", layer_label(.layer))]
    DegenerateInput {
        layer: Option<usize>,
        kind: LossKind,
        reason: String,
    },

    /// Aggregated loss was NaN or infinite after weighting.
    #[error("Non-finite loss at step {step}: {breakdown}")]
    Numerical { step: usize, breakdown: String },

    /// This rank failed to complete a collective.
    #[error("Collective failure on rank {rank}{}: {message}", step_label(.step))]
    Collective {
        rank: usize,
        step: Option<usize>,
        message: String,
    },

    /// A rank aborted the run. `step` is the origin's step when it knew one.
    #[error("Run aborted by rank {origin_rank}{}: {reason}", step_label(.step))]
    Aborted {
        origin_rank: usize,
        step: Option<usize>,
        reason: String,
    },

    /// Tensor shape contract broken.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// Errors from the Candle tensor library
    #[error("Candle error: {0}")]
    Candle(String),

    /// I/O errors with path context
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// TOML/JSON decoding failures
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Result type alias for moxe operations
pub type MoxeResult<T> = std::result::Result<T, MoxeError>;

fn layer_label(layer: &Option<usize>) -> String {
    match layer {
        Some(idx) => format!("layer {}", idx),
        None => "global scope".to_string(),
    }
}

fn step_label(step: &Option<usize>) -> String {
    match step {
        Some(step) => format!(" at step {}", step),
        None => String::new(),
    }
}

impl MoxeError {
    /// Degenerate inputs only drop one term for one step; everything else is fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MoxeError::DegenerateInput { .. })
    }

    /// Errors that must be broadcast to every rank instead of being absorbed locally.
    pub fn should_abort_group(&self) -> bool {
        matches!(
            self,
            MoxeError::Numerical { .. } | MoxeError::Collective { .. } | MoxeError::Aborted { .. }
        )
    }

    /// Step index attached to the error, if any.
    pub fn step(&self) -> Option<usize> {
        match self {
            MoxeError::Numerical { step, .. } => Some(*step),
            MoxeError::Collective { step, .. } | MoxeError::Aborted { step, .. } => *step,
            _ => None,
        }
    }

    /// Attach `at` to a collective failure or abort that has no step yet.
    pub fn at_step(mut self, at: usize) -> Self {
        if let MoxeError::Collective { step, .. } | MoxeError::Aborted { step, .. } = &mut self {
            step.get_or_insert(at);
        }
        self
    }
}

impl From<candle_core::Error> for MoxeError {
    fn from(err: candle_core::Error) -> Self {
        MoxeError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for MoxeError {
    fn from(err: std::io::Error) -> Self {
        MoxeError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<toml::de::Error> for MoxeError {
    fn from(err: toml::de::Error) -> Self {
        MoxeError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for MoxeError {
    fn from(err: serde_json::Error) -> Self {
        MoxeError::Parse(err.to_string())
    }
}

/// Helper trait for adding path context to IO operations
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> MoxeResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> MoxeResult<T> {
        self.map_err(|e| MoxeError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating config errors
pub fn config_error(message: impl Into<String>) -> MoxeError {
    MoxeError::Config(message.into())
}

/// Helper for creating shape errors
pub fn shape_error(
    context: impl Into<String>,
    expected: impl Into<String>,
    actual: impl std::fmt::Debug,
) -> MoxeError {
    MoxeError::ShapeMismatch {
        context: context.into(),
        expected: expected.into(),
        actual: format!("{:?}", actual),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let degenerate = MoxeError::DegenerateInput {
            layer: Some(3),
            kind: LossKind::ZLoss,
            reason: "zero tokens".to_string(),
        };
        assert!(degenerate.is_recoverable());
        assert!(!degenerate.should_abort_group());

        let numerical = MoxeError::Numerical {
            step: 7,
            breakdown: "z_loss=NaN".to_string(),
        };
        assert!(!numerical.is_recoverable());
        assert!(numerical.should_abort_group());
        assert_eq!(numerical.step(), Some(7));

        assert!(!config_error("bad mesh").should_abort_group());
        assert!(MoxeError::Collective {
            rank: 1,
            step: None,
            message: "timeout".to_string()
        }
        .should_abort_group());
    }

    #[test]
    fn test_at_step_fills_collective_and_abort() {
        let timeout = MoxeError::Collective {
            rank: 4,
            step: None,
            message: "timed out".to_string(),
        }
        .at_step(3);
        assert_eq!(timeout.step(), Some(3));
        assert!(timeout.to_string().contains("rank 4 at step 3"));

        // A step set at the origin is kept.
        let aborted = MoxeError::Aborted {
            origin_rank: 5,
            step: Some(2),
            reason: "bad batch".to_string(),
        }
        .at_step(9);
        assert_eq!(aborted.step(), Some(2));

        assert_eq!(config_error("bad mesh").at_step(4).step(), None);
    }

    #[test]
    fn test_error_display() {
        let err = MoxeError::DegenerateInput {
            layer: Some(11),
            kind: LossKind::LoadBalance,
            reason: "zero tokens".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("layer 11"));
        assert!(msg.contains("load_balancing_loss"));

        let global = MoxeError::DegenerateInput {
            layer: None,
            kind: LossKind::Distillation,
            reason: "empty batch".to_string(),
        };
        assert!(global.to_string().contains("global scope"));

        let numerical = MoxeError::Numerical {
            step: 42,
            breakdown: "total=inf".to_string(),
        };
        assert!(numerical.to_string().contains("step 42"));
    }

    #[test]
    fn test_candle_conversion() {
        let candle_err = candle_core::Error::Msg("shape mismatch".to_string());
        let err: MoxeError = candle_err.into();
        assert!(matches!(err, MoxeError::Candle(_)));
    }

    #[test]
    fn test_io_with_path() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        match result.with_path("/tmp/moxe.toml") {
            Err(MoxeError::Io { path, .. }) => assert_eq!(path, "/tmp/moxe.toml"),
            other => panic!("Expected IO error with path, got {:?}", other),
        }
    }
}
