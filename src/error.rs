//! Error taxonomy for the loading seam.
//!
//! The loader distinguishes failures the dispatcher reacts to differently:
//! plain I/O and decode errors end a single request, `OutOfMemory` also
//! clears the decoded-image cache, and `Cancelled` means a newer request
//! superseded this one and the result must be discarded.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading and rotating a source image.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The file could not be read at all.
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bytes were read but could not be decoded as an image.
    #[error("failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Decoding would exceed the configured pixel-memory budget.
    #[error("decoding {path:?} needs {required} bytes, budget is {budget}")]
    OutOfMemory {
        path: PathBuf,
        required: u64,
        budget: u64,
    },

    /// The load was cooperatively aborted.
    #[error("load cancelled")]
    Cancelled,
}

impl LoadError {
    /// Whether this failure was a cooperative abort rather than a real error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }
}
