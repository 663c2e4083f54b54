use crate::models::Stage;
use thiserror::Error;

/// A stage could not resolve one or more logical fields to real columns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage}: missing required columns: {}", .fields.join(", "))]
pub struct MissingColumnError {
    pub stage: Stage,
    pub fields: Vec<String>,
}

impl MissingColumnError {
    pub fn new(stage: Stage, fields: Vec<String>) -> Self {
        Self { stage, fields }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error(transparent)]
    MissingColumn(#[from] MissingColumnError),

    #[error("{requested} cannot run before {pending} has completed")]
    OutOfOrder { requested: Stage, pending: Stage },

    #[error("all steps have already been run")]
    Finished,
}
