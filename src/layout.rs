use std::path::{Path, PathBuf};

use crate::subsystem::Subsystem;

const LEDGER_FILE: &str = "info.json";
const LEDGER_LOCK_FILE: &str = "info.lock";
const SAFE_MODE_DIR: &str = "safe-mode";
const PROCESS_DIR: &str = "processes";
const VERSION_PREFIX: &str = "patch-";
const BUNDLE_EXTENSION: &str = "bundle";

pub const DEFAULT_OPTIMIZE_DIR: &str = "odex";
pub const INTERPRET_OPTIMIZE_DIR: &str = "interpret";

#[derive(Debug, Clone)]
pub struct PatchLayout {
    root: PathBuf,
}

impl PatchLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn ledger_lock_file(&self) -> PathBuf {
        self.root.join(LEDGER_LOCK_FILE)
    }

    pub fn safe_mode_dir(&self) -> PathBuf {
        self.root.join(SAFE_MODE_DIR)
    }

    pub fn process_dir(&self) -> PathBuf {
        self.root.join(PROCESS_DIR)
    }

    pub fn version_dir(&self, version: &str) -> Option<PathBuf> {
        version_dir_name(version).map(|name| self.root.join(name))
    }

    pub fn version_file(&self, version: &str) -> Option<PathBuf> {
        let name = version_dir_name(version)?;
        Some(
            self.root
                .join(&name)
                .join(format!("{name}.{BUNDLE_EXTENSION}")),
        )
    }
}

pub fn version_dir_name(version: &str) -> Option<String> {
    if !is_valid_version(version) {
        return None;
    }
    Some(format!("{VERSION_PREFIX}{version}"))
}

pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

pub fn signature_path(version_file: &Path) -> PathBuf {
    let file_name = version_file
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("bundle");
    version_file.with_file_name(format!("{file_name}.sig"))
}

pub fn sub_bundle_dir(version_dir: &Path, subsystem: Subsystem) -> PathBuf {
    version_dir.join(subsystem.dir_name())
}

pub fn optimize_dir(version_dir: &Path, dir_name: &str) -> PathBuf {
    version_dir.join(dir_name)
}
