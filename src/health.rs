//! Health artifact
//!
//! A small JSON file in the data directory reflecting directory linkage,
//! rewritten on every heartbeat outcome. External tooling watches this file
//! rather than polling the REST surface.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthArtifact {
    pub status: HealthStatus,
    pub last_heartbeat_at: Option<String>,
    pub updated_at: String,
}

pub struct HealthFile {
    path: PathBuf,
}

impl HealthFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn write(&self, status: HealthStatus, last_heartbeat_at: Option<&str>) -> Result<()> {
        let artifact = HealthArtifact {
            status,
            last_heartbeat_at: last_heartbeat_at.map(String::from),
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        std::fs::write(&self.path, serde_json::to_vec_pretty(&artifact)?)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
