//! Wire types shared by the field agent and the archive server.

use serde::{Deserialize, Serialize};

pub const MANIFEST_ROUTE: &str = "/manifest";
pub const BATCH_ROUTE: &str = "/batch";
pub const HEALTH_ROUTE: &str = "/health";

/// Content type of a batch response: a tar stream compressed with zstd.
pub const BATCH_CONTENT_TYPE: &str = "application/x-tar+zstd";

/// `POST /batch` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(default)]
    pub files: Option<usize>,
}
