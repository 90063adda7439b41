//! Container data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container model stored in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerModel {
    pub name: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

impl ContainerModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            etag: format!("\"0x{}\"", uuid::Uuid::new_v4().simple()),
            last_modified: Utc::now(),
        }
    }
}
