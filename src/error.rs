//! Error kinds for the probe, instance and record pipeline.
//!
//! Every setup-phase variant is fatal to a run; `RecordDecode` is handled per
//! record by the iterator and never aborts the capture.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnoopError {
    /// A probe description or trace instance could not be created.
    #[error("{label}: {detail}")]
    Allocation { label: String, detail: String },

    /// The kernel rejected the probe, or a named event does not exist.
    #[error("{label}: {detail}")]
    Install { label: String, detail: String },

    /// The instance's enabled-event set could not be reset or enabled.
    #[error("{label}: {detail}")]
    Filter { label: String, detail: String },

    /// Clearing the buffer or toggling tracing failed.
    #[error("{label}: {detail}")]
    TraceControl { label: String, detail: String },

    /// A single record could not be decoded.
    #[error("{label}: {detail}")]
    RecordDecode { label: String, detail: String },

    /// A destroy call failed.
    #[error("{label}: {detail}")]
    Teardown { label: String, detail: String },
}

impl SnoopError {
    pub fn allocation(label: impl Into<String>, detail: impl Into<String>) -> Self {
        SnoopError::Allocation {
            label: label.into(),
            detail: detail.into(),
        }
    }

    pub fn install(label: impl Into<String>, detail: impl Into<String>) -> Self {
        SnoopError::Install {
            label: label.into(),
            detail: detail.into(),
        }
    }

    pub fn filter(label: impl Into<String>, detail: impl Into<String>) -> Self {
        SnoopError::Filter {
            label: label.into(),
            detail: detail.into(),
        }
    }

    pub fn trace_control(label: impl Into<String>, detail: impl Into<String>) -> Self {
        SnoopError::TraceControl {
            label: label.into(),
            detail: detail.into(),
        }
    }

    pub fn record_decode(label: impl Into<String>, detail: impl Into<String>) -> Self {
        SnoopError::RecordDecode {
            label: label.into(),
            detail: detail.into(),
        }
    }

    pub fn teardown(label: impl Into<String>, detail: impl Into<String>) -> Self {
        SnoopError::Teardown {
            label: label.into(),
            detail: detail.into(),
        }
    }

    /// Short label naming the step that failed.
    pub fn label(&self) -> &str {
        match self {
            SnoopError::Allocation { label, .. }
            | SnoopError::Install { label, .. }
            | SnoopError::Filter { label, .. }
            | SnoopError::TraceControl { label, .. }
            | SnoopError::RecordDecode { label, .. }
            | SnoopError::Teardown { label, .. } => label,
        }
    }

    /// Setup failures abort the run; decode failures only skip a record.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SnoopError::RecordDecode { .. })
    }
}

/// Joins an io error with the kernel's own explanation, if it left one.
pub(crate) fn describe(err: &io::Error, last_error: Option<String>) -> String {
    match last_error {
        Some(log) => format!("{err} (tracefs err: {log})"),
        None => err.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, SnoopError>;
