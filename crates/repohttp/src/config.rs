//! Upload service configuration.
//!
//! [`UploadConfig`] carries the few runtime parameters of the service with
//! sensible defaults. All fields are public; builder-style `with_*` methods
//! are provided for call-site ergonomics.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default scratch directory for in-flight uploads.
pub const DEFAULT_TEMP_DIR: &str = "/tmp/seafhttp";

/// Default upload size limit (100 MiB), enforced after the body has been
/// received.
pub const DEFAULT_MAX_UPLOAD_FILE_SIZE: u64 = 100 * (1 << 20);

/// Upload service configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Base URL of the web front-end. Success and error redirects are
    /// rendered under this URL.
    pub service_url: String,

    /// Directory where file parts are spooled while a request is in
    /// flight. Created at service build time if absent.
    pub temp_dir: PathBuf,

    /// Maximum accepted file size in bytes. Uploads larger than this are
    /// rejected after receipt with the `Size` error code.
    pub max_upload_file_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:8000".to_owned(),
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            max_upload_file_size: DEFAULT_MAX_UPLOAD_FILE_SIZE,
        }
    }
}

impl UploadConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the front-end base URL used in redirects.
    #[must_use]
    pub fn with_service_url(mut self, url: impl Into<String>) -> Self {
        self.service_url = url.into();
        self
    }

    /// Sets the scratch directory for in-flight uploads.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Sets the post-receipt upload size limit in bytes.
    #[must_use]
    pub fn with_max_upload_file_size(mut self, size: u64) -> Self {
        self.max_upload_file_size = size;
        self
    }
}
