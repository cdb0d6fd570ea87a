//! On-disk diagnostic reports.
//!
//! One JSON file per reported error under `${CWD}/error_reports/`,
//! carrying the error text, its taxonomy group, retryability and any
//! caller-supplied context.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::info;

use crate::error::ClientError;
use crate::events::event::now_micros;

pub struct ErrorReporter {
    dir: PathBuf,
}

impl ErrorReporter {
    /// Reports land in `error_reports/` under the current directory.
    pub fn new() -> Result<ErrorReporter, ClientError> {
        let cwd = std::env::current_dir()
            .map_err(|e| ClientError::Config(format!("resolving cwd: {}", e)))?;
        Ok(Self::with_dir(cwd.join("error_reports")))
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> ErrorReporter {
        ErrorReporter { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one report; returns the file path.
    pub fn report(
        &self,
        error: &ClientError,
        context: BTreeMap<String, Value>,
    ) -> Result<PathBuf, ClientError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| ClientError::Config(format!("creating {}: {}", self.dir.display(), e)))?;
        let timestamp = now_micros();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let path = self
            .dir
            .join(format!("error_report_{}_{}.json", timestamp, &nonce[..8]));
        let body = json!({
            "timestamp_micros": timestamp,
            "error": error.to_string(),
            "group": format!("{:?}", error.group()),
            "retryable": error.is_retryable(),
            "context": context,
        });
        std::fs::write(&path, serde_json::to_string_pretty(&body)?)
            .map_err(|e| ClientError::Config(format!("writing {}: {}", path.display(), e)))?;
        info!(path = %path.display(), "wrote error report");
        Ok(path)
    }
}
