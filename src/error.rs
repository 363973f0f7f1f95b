//! Error types for roster-sync

use thiserror::Error;

use crate::model::{ActivityType, Weekday};

#[derive(Error, Debug)]
pub enum RosterError {
    /// A remote read, write or subscription failed. `operation` names the
    /// call so the UI can report which action did not go through.
    #[error("Remote {operation} failed: {message}")]
    Remote { operation: String, message: String },

    #[error("No {activity} slot on {day}")]
    InvalidSlot { activity: ActivityType, day: Weekday },

    #[error("Week start {0} is not a Monday")]
    InvalidWeek(chrono::NaiveDate),

    #[error("Invalid document {key}: {reason}")]
    InvalidDocument { key: String, reason: String },

    #[error("Batch of {size} exceeds store limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("`in` filter with {size} values exceeds limit of {limit}")]
    FilterTooLarge { size: usize, limit: usize },

    #[error("Roster view is closed")]
    ViewClosed,

    #[error("A save is already in flight for this view")]
    SaveInProgress,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RosterError {
    pub fn remote(operation: &str, message: impl ToString) -> Self {
        RosterError::Remote {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RosterError>;
