//! Error taxonomy shared by every workflow operation.
//!
//! Validation and authorization failures are raised before any mutation;
//! mutation-phase failures abort the surrounding sled transaction, so a
//! caller never observes partial state.

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("jurisdiction misconfigured: {0}")]
    Configuration(String),
    #[error("upstream collaborator failed: {0}")]
    UpstreamFailure(String),
    #[error("codec failure: {0}")]
    Codec(String),
}

impl WorkflowError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
    pub fn forbidden(why: impl Into<String>) -> Self {
        Self::Forbidden(why.into())
    }
    pub fn precondition(why: impl Into<String>) -> Self {
        Self::PreconditionFailed(why.into())
    }
    pub fn conflict(why: impl Into<String>) -> Self {
        Self::Conflict(why.into())
    }
    pub fn configuration(why: impl Into<String>) -> Self {
        Self::Configuration(why.into())
    }
}
