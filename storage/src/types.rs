use chrono::{DateTime, Utc};

/// Represents an object in storage
#[derive(Debug, Clone)]
pub struct ObjectListing {
    /// Key (path) of the object
    pub key: String,
    /// Last modified time
    pub last_modified: DateTime<Utc>,
}

impl ObjectListing {
    /// Final path component of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}
