// ABOUTME: Error taxonomy for the reflector engine
// ABOUTME: Separates configuration, identity, stream and task failures

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReflectorError>;

#[derive(Debug, Error)]
pub enum ReflectorError {
    /// Registration was attempted without a change source. No job is started.
    #[error("ReflectorConfig.source must be defined (was None)")]
    MissingSource,

    /// An object could not yield an identity. This is a broken contract between
    /// the change source and the engine, so the engine stops instead of skipping.
    #[error("{type_name} internal error: object identity unavailable: {reason}")]
    Identity {
        type_name: &'static str,
        reason: String,
    },

    /// The change source failed unrecoverably.
    #[error("change source failed: {0:#}")]
    Source(#[source] anyhow::Error),

    /// The change source task panicked or was cancelled out from under the engine.
    #[error("change source task failed: {0}")]
    TaskFailed(String),
}

impl ReflectorError {
    /// True for failures that indicate a defect rather than an environmental problem.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, ReflectorError::Identity { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("connection reset").context("watch failed");
        let err = ReflectorError::Source(inner);
        let message = err.to_string();
        assert!(message.contains("watch failed"));
        assert!(message.contains("connection reset"));
        assert!(!err.is_invariant_violation());
    }

    #[test]
    fn test_identity_error_is_invariant_violation() {
        let err = ReflectorError::Identity {
            type_name: "Node",
            reason: "object has no name".to_string(),
        };
        assert!(err.is_invariant_violation());
        assert!(err.to_string().starts_with("Node internal error"));
    }
}
