use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fsutil::write_atomic;
use crate::loader::LoadOutcome;

const REPORT_SCHEMA_VERSION: u32 = 1;
const LATEST_FILE: &str = "latest.json";
const HISTORY_FILE: &str = "history.jsonl";
const ROTATED_HISTORY_FILE: &str = "history.jsonl.1";
const DEFAULT_HISTORY_LIMIT_BYTES: u64 = 1024 * 1024;

pub trait OutcomeSink: Send + Sync {
    fn publish(&self, outcome: &LoadOutcome) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeSnapshot {
    pub schema_version: u32,
    pub updated_at: String,
    pub total_loads: u64,
    pub ok_loads: u64,
    pub failed_loads: u64,
    pub last_result_code: Option<i32>,
    pub last_outcome: Option<serde_json::Value>,
}

impl Default for OutcomeSnapshot {
    fn default() -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            updated_at: Utc::now().to_rfc3339(),
            total_loads: 0,
            ok_loads: 0,
            failed_loads: 0,
            last_result_code: None,
            last_outcome: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonOutcomeSink {
    dir: PathBuf,
    history_limit_bytes: u64,
}

impl JsonOutcomeSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            history_limit_bytes: DEFAULT_HISTORY_LIMIT_BYTES,
        }
    }

    pub fn with_history_limit(mut self, bytes: u64) -> Self {
        self.history_limit_bytes = bytes;
        self
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    pub fn snapshot(&self) -> Result<OutcomeSnapshot> {
        load_snapshot(&self.latest_path())
    }

    pub fn rotated_history_path(&self) -> PathBuf {
        self.dir.join(ROTATED_HISTORY_FILE)
    }

    fn rotate_history(&self) -> Result<()> {
        let path = self.history_path();
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.history_limit_bytes {
            return Ok(());
        }
        let rotated = self.rotated_history_path();
        fs::rename(&path, &rotated).with_context(|| {
            format!(
                "failed rotating outcome history {} -> {}",
                path.display(),
                rotated.display()
            )
        })?;
        debug!(history = %rotated.display(), size, "outcome history rotated");
        Ok(())
    }

    fn append_history(&self, line: &str) -> Result<()> {
        self.rotate_history()?;
        let path = self.history_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed opening outcome history {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed appending outcome history {}", path.display()))
    }
}

impl OutcomeSink for JsonOutcomeSink {
    fn publish(&self, outcome: &LoadOutcome) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed creating outcome dir {}", self.dir.display()))?;

        let value = serde_json::to_value(outcome).context("failed encoding load outcome")?;
        let mut snapshot = self.snapshot()?;
        snapshot.schema_version = REPORT_SCHEMA_VERSION;
        snapshot.updated_at = Utc::now().to_rfc3339();
        snapshot.total_loads = snapshot.total_loads.saturating_add(1);
        if outcome.is_ok() {
            snapshot.ok_loads = snapshot.ok_loads.saturating_add(1);
        } else {
            snapshot.failed_loads = snapshot.failed_loads.saturating_add(1);
        }
        snapshot.last_result_code = Some(outcome.result_code);
        snapshot.last_outcome = Some(value.clone());

        let payload =
            serde_json::to_string_pretty(&snapshot).context("failed encoding outcome snapshot")?;
        write_atomic(&self.latest_path(), payload.as_bytes())?;
        self.append_history(&value.to_string())?;
        debug!(
            dir = %self.dir.display(),
            result_code = outcome.result_code,
            "load outcome published"
        );
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<OutcomeSnapshot> {
    if !path.exists() {
        return Ok(OutcomeSnapshot::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading outcome file {}", path.display()))?;
    let mut snapshot: OutcomeSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed decoding outcome file {}", path.display()))?;

    if snapshot.schema_version == 0 {
        snapshot.schema_version = REPORT_SCHEMA_VERSION;
    }
    if snapshot.updated_at.trim().is_empty() {
        snapshot.updated_at = Utc::now().to_rfc3339();
    }

    Ok(snapshot)
}
