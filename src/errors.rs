//! Per-stage failures.
//!
//! Configuration problems are plain [`anyhow::Error`] values and abort the run.
//! Everything that can go wrong while processing a single document (or a
//! single result object) is a [`StageError`], which the pipeline records and
//! then skips past.

use std::{fmt, time::Duration};

use schemars::JsonSchema;
use thiserror::Error;

use crate::prelude::*;

/// The pipeline stages, in the order a document passes through them.
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Upload,
    Submit,
    Wait,
    Fetch,
    Transform,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discover => "discover",
            Stage::Upload => "upload",
            Stage::Submit => "submit",
            Stage::Wait => "wait",
            Stage::Fetch => "fetch",
            Stage::Transform => "transform",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

/// A failure scoped to one document or one result object.
#[derive(Debug, Error)]
pub enum StageError {
    /// A local input directory does not exist.
    #[error("directory not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Another document in the batch has the same identifier, so the two would
    /// share a result prefix and an output table.
    #[error("identifier {id:?} is already used by {}", first.display())]
    DuplicateId { id: String, first: PathBuf },

    /// Upload, list or download failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The OCR service refused the recognition request.
    #[error("recognition request rejected: {0}")]
    Submission(String),

    /// The OCR service reported that the job failed.
    #[error("recognition job failed: {0}")]
    JobFailed(String),

    /// The job did not finish before the deadline.
    #[error("recognition job did not finish within {}s", .0.as_secs())]
    JobTimeout(Duration),

    /// A result object is not a valid annotation file.
    #[error("malformed recognition result: {0}")]
    Parse(String),
}

impl StageError {
    /// Wrap an [`anyhow::Error`] as a transfer failure, keeping its context
    /// chain in the message.
    pub fn transfer(err: anyhow::Error) -> Self {
        Self::Transfer(format!("{err:#}"))
    }

    /// Wrap an [`anyhow::Error`] as a submission failure.
    pub fn submission(err: anyhow::Error) -> Self {
        Self::Submission(format!("{err:#}"))
    }
}
