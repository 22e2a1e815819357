//! Error taxonomy for the capture and processing core.
//!
//! Public operations return `anyhow::Result`; these variants are wrapped into
//! `anyhow::Error` at the boundary so callers can `downcast_ref::<KernelError>()`
//! when they need to tell a transient acquisition hiccup from a bad
//! configuration. Queue saturation is deliberately absent: a full queue is
//! handled by drop-oldest and only counted.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    /// Source temporarily failed to deliver a frame. Retried with backoff.
    #[error("transient acquisition error: {0}")]
    TransientAcquisition(String),

    /// Invalid device or dimensions at start. The dispatcher stays stopped.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Pipeline description could not be parsed (whole document or one entry).
    #[error("pipeline config parse error: {0}")]
    PipelineConfigParse(String),

    /// Stage descriptor named a type the registry does not know.
    #[error("unknown stage type '{0}'")]
    UnknownStageType(String),

    /// A stage failed on one frame. The frame gets no mask.
    #[error("stage '{stage}' failed: {reason}")]
    StageFault { stage: &'static str, reason: String },
}

impl KernelError {
    pub fn configuration(msg: impl Into<String>) -> anyhow::Error {
        KernelError::Configuration(msg.into()).into()
    }

    pub fn transient(msg: impl Into<String>) -> anyhow::Error {
        KernelError::TransientAcquisition(msg.into()).into()
    }

    pub fn stage_fault(stage: &'static str, reason: impl Into<String>) -> anyhow::Error {
        KernelError::StageFault {
            stage,
            reason: reason.into(),
        }
        .into()
    }

    /// Returns the taxonomy entry carried by `err`, if any.
    pub fn classify(err: &anyhow::Error) -> Option<&KernelError> {
        err.downcast_ref::<KernelError>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recovers_variant_through_anyhow() {
        let err = KernelError::configuration("width must be > 0");
        assert!(matches!(
            KernelError::classify(&err),
            Some(KernelError::Configuration(_))
        ));

        let err = anyhow::anyhow!("plain");
        assert!(KernelError::classify(&err).is_none());
    }

    #[test]
    fn stage_fault_message_names_stage() {
        let err = KernelError::stage_fault("morphology", "mask shape mismatch");
        assert_eq!(
            err.to_string(),
            "stage 'morphology' failed: mask shape mismatch"
        );
    }
}
