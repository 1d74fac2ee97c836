//! Command surface for the desktop shell.
//!
//! Commands are organized by domain:
//! - `jobs`: Job queries and lifecycle operations
//! - `upload`: Importing picked files into the library
//!
//! Every command returns an [`ApiResponse`], so failures reach the UI as data
//! rather than as transport errors.

pub mod jobs;
pub mod upload;

pub use jobs::*;
pub use upload::*;

use serde::Serialize;

/// Response wrapper for API calls.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
