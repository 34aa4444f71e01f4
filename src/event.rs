//! File events returned by fetch/query round trips

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of one remote round trip for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    /// Local copy already present and neither replace nor version was set
    FileExists,
    /// The file vanished between notification and fetch
    FileNotFound,
    /// Connection to the remote is broken
    IoError,
    /// Any other remote or local failure code
    Other(i32),
}

impl Status {
    pub fn code(&self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::FileExists => 1,
            Status::FileNotFound => 2,
            Status::IoError => 3,
            Status::Other(code) => *code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => f.write_str("OK"),
            Status::FileExists => f.write_str("FILE_EXISTS"),
            Status::FileNotFound => f.write_str("FILE_NOT_FOUND"),
            Status::IoError => f.write_str("IO_ERROR"),
            Status::Other(code) => write!(f, "ERROR({})", code),
        }
    }
}

/// Metadata for one remote file plus the status of the round trip that produced it.
///
/// Never mutated after it is handed to the result processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEvent {
    /// Remote file name; absent for failures not tied to a file
    pub name: Option<String>,
    pub file_type: String,
    pub server_group: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub status: Status,
    /// Remote-supplied detail for non-OK statuses
    pub message: Option<String>,
    pub receipt_id: Option<String>,
    /// Where the file landed locally (replicated path when replicating)
    pub local_path: Option<PathBuf>,
}

impl FileEvent {
    pub fn new(name: &str, file_type: &str, server_group: &str, status: Status) -> Self {
        Self {
            name: Some(name.to_string()),
            file_type: file_type.to_string(),
            server_group: server_group.to_string(),
            size: 0,
            modified: None,
            created: None,
            checksum: None,
            status,
            message: None,
            receipt_id: None,
            local_path: None,
        }
    }

    /// A failure with no file attached
    pub fn failure(file_type: &str, server_group: &str, status: Status, message: &str) -> Self {
        Self {
            name: None,
            message: Some(message.to_string()),
            ..Self::new("", file_type, server_group, status)
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_times(mut self, modified: Option<DateTime<Utc>>, created: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self.created = created;
        self
    }

    pub fn with_checksum(mut self, checksum: String) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_receipt(mut self, receipt_id: String) -> Self {
        self.receipt_id = Some(receipt_id);
        self
    }

    pub fn with_local_path(mut self, path: PathBuf) -> Self {
        self.local_path = Some(path);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Display name for logs
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<none>")
    }
}
