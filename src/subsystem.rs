use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fsutil::{compute_sha256_hex, normalize_sha256_hex};
use crate::integrity::VerifiedPackage;
use crate::layout::sub_bundle_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Code,
    AltRuntime,
    Native,
    Resources,
}

impl Subsystem {
    pub const ALL: [Subsystem; 4] = [
        Subsystem::Code,
        Subsystem::AltRuntime,
        Subsystem::Native,
        Subsystem::Resources,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::AltRuntime => "alt_runtime",
            Self::Native => "native",
            Self::Resources => "resources",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::AltRuntime => "alt",
            Self::Native => "lib",
            Self::Resources => "res",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsystemFlags {
    pub code: bool,
    pub alt_runtime: bool,
    pub native: bool,
    pub resources: bool,
}

impl SubsystemFlags {
    pub fn all() -> Self {
        Self {
            code: true,
            alt_runtime: true,
            native: true,
            resources: true,
        }
    }

    pub fn is_enabled(&self, subsystem: Subsystem) -> bool {
        match subsystem {
            Subsystem::Code => self.code,
            Subsystem::AltRuntime => self.alt_runtime,
            Subsystem::Native => self.native,
            Subsystem::Resources => self.resources,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemFailure {
    DirectoryMissing,
    EntryMissing,
    ChecksumMismatch,
}

#[derive(Debug, Clone)]
pub struct SubsystemCheckError {
    pub subsystem: Subsystem,
    pub failure: SubsystemFailure,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct CheckedEntry {
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct CheckedSubBundle {
    pub subsystem: Subsystem,
    pub dir: PathBuf,
    pub entries: Vec<CheckedEntry>,
}

impl CheckedSubBundle {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|entry| entry.path.clone()).collect()
    }
}

pub fn check_complete(
    subsystem: Subsystem,
    version_dir: &Path,
    package: &VerifiedPackage,
) -> Result<CheckedSubBundle, SubsystemCheckError> {
    let dir = sub_bundle_dir(version_dir, subsystem);
    let Some(section) = package
        .manifest
        .subsystems
        .get(subsystem)
        .filter(|section| !section.entries.is_empty())
    else {
        return Ok(CheckedSubBundle {
            subsystem,
            dir,
            entries: Vec::new(),
        });
    };

    let fail = |failure: SubsystemFailure, detail: String| SubsystemCheckError {
        subsystem,
        failure,
        detail,
    };

    if !dir.is_dir() {
        return Err(fail(
            SubsystemFailure::DirectoryMissing,
            format!("sub-bundle directory does not exist: {}", dir.display()),
        ));
    }

    let mut entries = Vec::with_capacity(section.entries.len());
    for entry in &section.entries {
        if !is_safe_entry_name(&entry.name) {
            return Err(fail(
                SubsystemFailure::EntryMissing,
                format!("entry name escapes sub-bundle: {}", entry.name),
            ));
        }
        let path = dir.join(&entry.name);
        if !path.is_file() {
            return Err(fail(
                SubsystemFailure::EntryMissing,
                format!("sub-bundle entry does not exist: {}", path.display()),
            ));
        }
        let actual = compute_sha256_hex(&path).map_err(|err| {
            fail(
                SubsystemFailure::EntryMissing,
                format!("failed hashing {}: {err:#}", path.display()),
            )
        })?;
        let expected = normalize_sha256_hex(&entry.sha256).map_err(|err| {
            fail(
                SubsystemFailure::ChecksumMismatch,
                format!("invalid checksum for {}: {err:#}", entry.name),
            )
        })?;
        if actual != expected {
            warn!(
                subsystem = subsystem.as_str(),
                entry = %entry.name,
                expected = %entry.sha256,
                actual = %actual,
                "sub-bundle checksum mismatch"
            );
            return Err(fail(
                SubsystemFailure::ChecksumMismatch,
                format!(
                    "checksum mismatch for {} (expected {}, got {})",
                    path.display(),
                    entry.sha256,
                    actual
                ),
            ));
        }
        entries.push(CheckedEntry {
            name: entry.name.clone(),
            path,
            sha256: actual,
        });
    }

    Ok(CheckedSubBundle {
        subsystem,
        dir,
        entries,
    })
}

/// Directories holding patched native libraries: the sub-bundle root first,
/// then each per-ABI sub-directory in manifest order.
pub fn native_search_dirs(bundle: &CheckedSubBundle) -> Vec<PathBuf> {
    let mut dirs = vec![bundle.dir.clone()];
    for entry in &bundle.entries {
        if let Some(parent) = entry.path.parent() {
            if !dirs.iter().any(|existing| existing == parent) {
                dirs.push(parent.to_path_buf());
            }
        }
    }
    dirs
}

fn is_safe_entry_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.trim().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}
