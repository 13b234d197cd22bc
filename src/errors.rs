// /src/errors.rs
//! Error taxonomy. Every variant is a precondition violation detected
//! synchronously at the point of misuse; nothing here is retried.
use crate::types::{ItemId, SectionId};
use thiserror::Error;

/// Which side of a diff failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSide {
    Old,
    New,
}

impl std::fmt::Display for SnapshotSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotSide::Old => f.write_str("old"),
            SnapshotSide::New => f.write_str("new"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Duplicate identifier '{id}'")]
    DuplicateIdentifier { id: String },

    #[error("Unknown section '{0}'")]
    UnknownSection(SectionId),

    #[error("Unknown parent item '{0}'")]
    UnknownParent(ItemId),

    #[error("Unknown item '{0}'")]
    UnknownItem(ItemId),

    #[error("Invalid nesting for '{id}': {details}")]
    InvalidNesting { id: ItemId, details: String },

    #[error("Invalid reorder: {details}")]
    InvalidReorder { details: String },

    #[error("Invalid {which} snapshot: {source}")]
    InvalidSnapshot {
        which: SnapshotSide,
        #[source]
        source: Box<SnapshotError>,
    },
}

impl SnapshotError {
    pub(crate) fn duplicate(id: impl std::fmt::Display) -> Self {
        SnapshotError::DuplicateIdentifier { id: id.to_string() }
    }

    pub(crate) fn nesting(id: &ItemId, details: impl Into<String>) -> Self {
        SnapshotError::InvalidNesting {
            id: id.clone(),
            details: details.into(),
        }
    }

    pub(crate) fn invalid(which: SnapshotSide, source: SnapshotError) -> Self {
        SnapshotError::InvalidSnapshot {
            which,
            source: Box::new(source),
        }
    }
}

/// Failure reported by a presentation adapter. The data source logs it and
/// keeps its previously retained snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Presentation failed: {message}")]
pub struct PresentationError {
    pub message: String,
}

impl PresentationError {
    pub fn new(message: impl Into<String>) -> Self {
        PresentationError {
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DataSourceError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Apply worker is no longer running")]
    WorkerStopped,

    #[error("Data source called re-entrantly from its own apply worker")]
    Reentrant,

    #[error("Failed to spawn apply worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}
