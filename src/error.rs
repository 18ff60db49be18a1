//! Error types raised while composing a pipeline.

use thiserror::Error;

use crate::pipeline::ComposerState;

pub type Result<T> = std::result::Result<T, CompositionError>;

/// Fatal, local errors detected at composition time. None of these are
/// retried: they are raised by the call that caused them and leave the
/// composer untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompositionError {
    #[error("{kind} name '{name}' is already declared")]
    DuplicateName { kind: &'static str, name: String },

    #[error("action '{action}' consumes artifact '{artifact}' which no prior action produces")]
    DanglingArtifact { action: String, artifact: String },

    #[error("pipeline '{0}' is finalized; no further stages or actions can be added")]
    Finalized(String),

    #[error("{0} requires at least one entry")]
    EmptyInput(&'static str),

    #[error("cannot {operation} while the pipeline is in state {state:?}")]
    OutOfOrder {
        operation: &'static str,
        state: ComposerState,
    },

    #[error("stage handle #{0} does not belong to this pipeline")]
    UnknownStage(usize),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error(
        "cross-stage reference to output '{output}' of stack '{stack}': consume it through its export instead"
    )]
    CrossStageReference { stack: String, output: String },

    #[error("export '{0}' is not published by any stack deployed at or before this stage")]
    UnpublishedExport(String),

    #[error(
        "export '{export}' is published in region '{region}'; imports only resolve in the pipeline's own region"
    )]
    CrossRegionImport { export: String, region: String },
}

impl CompositionError {
    pub fn duplicate(kind: &'static str, name: impl Into<String>) -> Self {
        Self::DuplicateName {
            kind,
            name: name.into(),
        }
    }
}
