use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fsutil::write_atomic;
use crate::layout::PatchLayout;

pub const PATCH_PROCESS_SUFFIX: &str = ":patch";
const PID_EXTENSION: &str = "pid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Main,
    PatchReceiver,
    Other,
}

impl ProcessRole {
    pub fn classify(app_id: &str, process_name: &str) -> Self {
        if process_name == app_id {
            Self::Main
        } else if process_name == format!("{app_id}{PATCH_PROCESS_SUFFIX}") {
            Self::PatchReceiver
        } else {
            Self::Other
        }
    }

    pub fn is_main(self) -> bool {
        self == Self::Main
    }
}

pub trait ProcessControl: Send + Sync {
    fn register(&self, _process_name: &str) -> Result<()> {
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        Ok(())
    }

    fn kill_siblings(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Registration {
    process_name: String,
    start_time: u64,
}

#[derive(Debug, Clone)]
pub struct PidDirectoryControl {
    dir: PathBuf,
    own_pid: u32,
}

impl PidDirectoryControl {
    pub fn new(layout: &PatchLayout) -> Self {
        Self {
            dir: layout.process_dir(),
            own_pid: std::process::id(),
        }
    }

    fn pid_file(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("{pid}.{PID_EXTENSION}"))
    }

    fn registered_pids(&self) -> Vec<(u32, PathBuf)> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some(PID_EXTENSION))
            .filter_map(|path| {
                let pid = path.file_stem()?.to_str()?.parse::<u32>().ok()?;
                Some((pid, path))
            })
            .collect()
    }

    fn live_registration(&self, pid: u32, path: &Path) -> Option<Registration> {
        let raw = fs::read_to_string(path).ok()?;
        let registration: Registration = serde_json::from_str(&raw).ok()?;
        let start_time = process_start_time(pid)?;
        if start_time != registration.start_time {
            debug!(
                pid,
                registered = registration.start_time,
                actual = start_time,
                "pid reused by another process"
            );
            return None;
        }
        Some(registration)
    }
}

impl ProcessControl for PidDirectoryControl {
    fn register(&self, process_name: &str) -> Result<()> {
        let start_time = process_start_time(self.own_pid)
            .ok_or_else(|| anyhow!("start time of pid {} is unavailable", self.own_pid))?;
        let registration = Registration {
            process_name: process_name.to_string(),
            start_time,
        };
        let payload = serde_json::to_vec(&registration).context("failed encoding registration")?;
        let path = self.pid_file(self.own_pid);
        write_atomic(&path, &payload)
            .with_context(|| format!("failed registering process {}", path.display()))
    }

    fn unregister(&self) -> Result<()> {
        let path = self.pid_file(self.own_pid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed removing registration {}", path.display()))
            }
        }
    }

    fn kill_siblings(&self) -> usize {
        let mut signalled = 0;
        for (pid, path) in self.registered_pids() {
            if pid == self.own_pid {
                continue;
            }
            let Some(registration) = self.live_registration(pid, &path) else {
                prune(pid, &path);
                continue;
            };
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            if raw <= 0 {
                continue;
            }
            match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => {
                    signalled += 1;
                    debug!(pid, process = %registration.process_name, "sibling process signalled");
                }
                Err(Errno::ESRCH) => prune(pid, &path),
                Err(err) => warn!(pid, error = %err, "failed signalling sibling process"),
            }
        }
        if signalled > 0 {
            info!(signalled, "sibling processes asked to exit");
        }
        signalled
    }
}

fn prune(pid: u32, path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        debug!(pid, error = %err, "failed pruning stale pid file");
    }
}

/// Field 22 of `/proc/<pid>/stat`, in clock ticks since boot.
fn process_start_time(pid: u32) -> Option<u64> {
    let raw = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (_, tail) = raw.rsplit_once(')')?;
    tail.split_whitespace().nth(19)?.parse::<u64>().ok()
}

#[derive(Debug, Default)]
pub struct RecordingProcessControl {
    calls: AtomicUsize,
}

impl RecordingProcessControl {
    pub fn kill_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProcessControl for RecordingProcessControl {
    fn kill_siblings(&self) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst);
        0
    }
}
