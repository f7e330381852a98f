use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fsutil::write_atomic;
use crate::layout::PatchLayout;

pub const DEFAULT_SAFE_MODE_MAX_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeModeVerdict {
    Proceed { attempt: u32 },
    Tripped { attempts: u32 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SafeModeState {
    #[serde(default)]
    count: u32,
    #[serde(default)]
    last_attempt_at: Option<String>,
    #[serde(default)]
    last_tripped_at: Option<String>,
    #[serde(default)]
    last_success_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafeModeReport {
    pub process: String,
    pub counter_path: String,
    pub state_exists: bool,
    pub max_count: u32,
    pub count: u32,
    pub will_trip: bool,
    pub last_attempt_at: Option<String>,
    pub last_tripped_at: Option<String>,
    pub last_success_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SafeModeStore {
    dir: PathBuf,
    max_count: u32,
}

impl SafeModeStore {
    pub fn new(layout: &PatchLayout, max_count: u32) -> Self {
        Self {
            dir: layout.safe_mode_dir(),
            max_count,
        }
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn counter_path(&self, process: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_process_name(process)))
    }

    /// Records one more load attempt. Once `max_count` attempts went by without
    /// an acknowledged success the gate trips and the counter starts over.
    pub fn check_and_increment(&self, process: &str) -> Result<SafeModeVerdict> {
        let path = self.counter_path(process);
        let mut state = read_state(&path);
        let now = Utc::now().to_rfc3339();

        if state.count >= self.max_count {
            let attempts = state.count;
            state.count = 0;
            state.last_tripped_at = Some(now);
            write_state(&path, &state)?;
            warn!(process, attempts, max = self.max_count, "safe mode tripped");
            return Ok(SafeModeVerdict::Tripped { attempts });
        }

        state.count = state.count.saturating_add(1);
        state.last_attempt_at = Some(now);
        write_state(&path, &state)?;
        Ok(SafeModeVerdict::Proceed {
            attempt: state.count,
        })
    }

    pub fn acknowledge_success(&self, process: &str) -> Result<SafeModeReport> {
        let path = self.counter_path(process);
        let mut state = read_state(&path);
        state.count = 0;
        state.last_success_at = Some(Utc::now().to_rfc3339());
        write_state(&path, &state)?;
        info!(process, "safe mode counter reset after healthy start");
        Ok(self.status(process))
    }

    pub fn status(&self, process: &str) -> SafeModeReport {
        let path = self.counter_path(process);
        let state_exists = path.exists();
        let state = read_state(&path);
        SafeModeReport {
            process: process.to_string(),
            counter_path: path.display().to_string(),
            state_exists,
            max_count: self.max_count,
            count: state.count,
            will_trip: state.count >= self.max_count,
            last_attempt_at: state.last_attempt_at,
            last_tripped_at: state.last_tripped_at,
            last_success_at: state.last_success_at,
        }
    }
}

fn sanitize_process_name(process: &str) -> String {
    let cleaned: String = process
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

fn read_state(path: &Path) -> SafeModeState {
    if !path.exists() {
        return SafeModeState::default();
    }
    let decoded = fs::read_to_string(path)
        .with_context(|| format!("failed reading safe-mode counter {}", path.display()))
        .and_then(|raw| {
            serde_json::from_str::<SafeModeState>(&raw)
                .with_context(|| format!("failed decoding safe-mode counter {}", path.display()))
        });
    match decoded {
        Ok(state) => state,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "resetting unreadable safe-mode counter");
            SafeModeState::default()
        }
    }
}

fn write_state(path: &Path, state: &SafeModeState) -> Result<()> {
    let payload =
        serde_json::to_vec_pretty(state).context("failed encoding safe-mode counter")?;
    write_atomic(path, &payload)
}
