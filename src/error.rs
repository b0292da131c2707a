//! Error types used by the kernel, step handlers and collaborators.
//!
//! - [`OperationError`]: misuse or structural errors raised by the
//!   [`OperationContext`](crate::OperationContext) API.
//! - [`StepError`]: what a step handler returns.
//! - [`PersistenceError`]: configuration persister failures.
//! - [`ServiceError`]: service container failures.
//! - [`ControllerError`]: controller-level failures (boot, shutdown).
//!
//! All types provide `as_label` (stable snake_case label for logs/metrics).

use thiserror::Error;

use crate::context::{ContextType, Stage};
use crate::model::ModelNode;

/// # Errors raised by the operation context API.
///
/// Structural resource errors (`NoSuchResource`, `NoChildType`, ...) are
/// expected failures: converted into a [`StepError`] with `?`, they become the
/// step's failure description.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// A step was added for a stage that has already finished.
    #[error("stage {stage} is already complete")]
    StageAlreadyComplete { stage: Stage },

    /// The operation reached DONE; nothing can be scheduled anymore.
    #[error("operation is already complete")]
    OperationAlreadyComplete,

    /// The stage is not permitted for this context type.
    #[error("stage {stage} is not valid for context type {context_type}")]
    InvalidStage {
        stage: Stage,
        context_type: ContextType,
    },

    /// Steps cannot be scheduled for [`Stage::Done`].
    #[error("invalid step stage {stage}")]
    InvalidStepStage { stage: Stage },

    /// Model writes after the MODEL stage.
    #[error("stage MODEL is already complete (current stage {stage})")]
    ModelStageComplete { stage: Stage },

    /// Runtime service modification outside RUNTIME/VERIFY or rollback.
    #[error("runtime services cannot be modified in stage {stage}")]
    RuntimeNotAvailable { stage: Stage },

    #[error("resource {address} does not exist")]
    NoSuchResource { address: String },

    #[error("no child type {child_type} at {address}")]
    NoChildType { address: String, child_type: String },

    #[error(
        "resource {ancestor} does not exist; a resource at {address} cannot be created until all ancestor resources have been added"
    )]
    MissingAncestor { ancestor: String, address: String },

    #[error("duplicate resource {address}")]
    DuplicateResource { address: String },

    #[error("cannot write to {address}: wildcard segments are read-only")]
    WildcardWrite { address: String },

    #[error("invalid address {address}")]
    InvalidAddress { address: String },

    /// A cancellable wait observed cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl OperationError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            OperationError::StageAlreadyComplete { .. } => "op_stage_complete",
            OperationError::OperationAlreadyComplete => "op_already_complete",
            OperationError::InvalidStage { .. } => "op_invalid_stage",
            OperationError::InvalidStepStage { .. } => "op_invalid_step_stage",
            OperationError::ModelStageComplete { .. } => "op_model_stage_complete",
            OperationError::RuntimeNotAvailable { .. } => "op_runtime_not_available",
            OperationError::NoSuchResource { .. } => "op_no_such_resource",
            OperationError::NoChildType { .. } => "op_no_child_type",
            OperationError::MissingAncestor { .. } => "op_missing_ancestor",
            OperationError::DuplicateResource { .. } => "op_duplicate_resource",
            OperationError::WildcardWrite { .. } => "op_wildcard_write",
            OperationError::InvalidAddress { .. } => "op_invalid_address",
            OperationError::Cancelled => "op_cancelled",
        }
    }

    /// Returns `true` for errors describing the model rather than API misuse.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            OperationError::NoSuchResource { .. }
                | OperationError::NoChildType { .. }
                | OperationError::MissingAncestor { .. }
                | OperationError::DuplicateResource { .. }
                | OperationError::WildcardWrite { .. }
                | OperationError::InvalidAddress { .. }
        )
    }
}

/// # Errors returned by step handlers.
///
/// The variant decides how the scheduler reacts when the step has not yet
/// completed:
/// - `OperationFailed`: expected failure; recorded as the failure description.
///   Rolls back in MODEL or when rollback-on-runtime-failure is set.
/// - `Cancelled`: always rolls back.
/// - `Unexpected`: handler bug; always rolls back.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("operation failed: {description}")]
    OperationFailed { description: ModelNode },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{error}")]
    Unexpected { error: String },
}

impl StepError {
    /// Expected failure with the given description.
    pub fn failed(description: impl Into<ModelNode>) -> Self {
        StepError::OperationFailed {
            description: description.into(),
        }
    }

    /// Handler programming error.
    pub fn unexpected(error: impl Into<String>) -> Self {
        StepError::Unexpected {
            error: error.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StepError::OperationFailed { .. } => "step_operation_failed",
            StepError::Cancelled => "step_cancelled",
            StepError::Unexpected { .. } => "step_unexpected",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            StepError::OperationFailed { description } => match description.as_str() {
                Some(s) => s.to_string(),
                None => description.to_string(),
            },
            StepError::Cancelled => "operation cancelled".to_string(),
            StepError::Unexpected { error } => error.clone(),
        }
    }

    #[inline]
    pub fn is_operation_failed(&self) -> bool {
        matches!(self, StepError::OperationFailed { .. })
    }
}

impl From<OperationError> for StepError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Cancelled => StepError::Cancelled,
            e if e.is_structural() => StepError::failed(e.to_string()),
            e => StepError::unexpected(e.to_string()),
        }
    }
}

/// # Errors produced by a configuration persister.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("{reason}")]
    Store { reason: String },
}

impl PersistenceError {
    pub fn as_label(&self) -> &'static str {
        match self {
            PersistenceError::Store { .. } => "persistence_store",
        }
    }
}

/// # Errors produced by the service container.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service {name} is already installed")]
    Duplicate { name: String },

    #[error("service {name} is not installed")]
    NotFound { name: String },

    /// Returned by [`Service::start`](crate::services::Service::start).
    #[error("service failed to start: {error}")]
    StartFailed { error: String },
}

impl ServiceError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ServiceError::Duplicate { .. } => "service_duplicate",
            ServiceError::NotFound { .. } => "service_not_found",
            ServiceError::StartFailed { .. } => "service_start_failed",
        }
    }
}

/// # Errors produced by the model controller.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// Boot finished with ROLLBACK; the committed model is unchanged.
    #[error("boot failed: {failure}")]
    BootFailed {
        /// Failure description of the boot context.
        failure: ModelNode,
    },

    #[error("controller already booted")]
    AlreadyBooted,

    /// The operation task ended without producing a response.
    #[error("operation task aborted: {reason}")]
    Aborted { reason: String },
}

impl ControllerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ControllerError::BootFailed { .. } => "controller_boot_failed",
            ControllerError::AlreadyBooted => "controller_already_booted",
            ControllerError::Aborted { .. } => "controller_aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_errors_become_expected_failures() {
        let err: StepError = OperationError::NoSuchResource {
            address: "/subsystem=web".into(),
        }
        .into();
        assert!(err.is_operation_failed());
        assert_eq!(err.as_message(), "resource /subsystem=web does not exist");
    }

    #[test]
    fn test_misuse_errors_become_unexpected() {
        let err: StepError = OperationError::InvalidStepStage { stage: Stage::Done }.into();
        assert_eq!(err.as_label(), "step_unexpected");

        let err: StepError = OperationError::Cancelled.into();
        assert_eq!(err, StepError::Cancelled);
    }
}
