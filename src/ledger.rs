use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fsutil::write_atomic;
use crate::layout::{PatchLayout, DEFAULT_OPTIMIZE_DIR, INTERPRET_OPTIMIZE_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OatMode {
    Default,
    Interpret,
    Transitioning,
}

impl OatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Interpret => "interpret",
            Self::Transitioning => "transitioning",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "default" => Some(Self::Default),
            "interpret" => Some(Self::Interpret),
            "transitioning" => Some(Self::Transitioning),
            _ => None,
        }
    }

    /// A pending transition settles on `default` in the main process and on
    /// `interpret` everywhere else until the main process commits.
    pub fn resolve_for(self, main_process: bool) -> Self {
        match self {
            Self::Transitioning if main_process => Self::Default,
            Self::Transitioning => Self::Interpret,
            other => other,
        }
    }

    pub fn optimize_dir_name(self) -> &'static str {
        match self {
            Self::Interpret => INTERPRET_OPTIMIZE_DIR,
            Self::Default | Self::Transitioning => DEFAULT_OPTIMIZE_DIR,
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger file does not exist: {0}")]
    NotFound(PathBuf),
    #[error("ledger is corrupted: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredLedger {
    old_version: Option<String>,
    new_version: Option<String>,
    #[serde(default)]
    version_to_remove: Option<String>,
    oat_mode: Option<String>,
    #[serde(default)]
    protected_app: bool,
    #[serde(default)]
    use_custom_patch: bool,
    #[serde(default)]
    platform_fingerprint: Option<String>,
    #[serde(default)]
    remove_interpret_dir_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchLedger {
    pub old_version: String,
    pub new_version: String,
    pub version_to_remove: String,
    pub oat_mode: OatMode,
    pub protected_app: bool,
    pub use_custom_patch: bool,
    pub platform_fingerprint: String,
    pub remove_interpret_dir_pending: bool,
}

impl PatchLedger {
    pub fn new(old_version: impl Into<String>, new_version: impl Into<String>) -> Self {
        Self {
            old_version: old_version.into(),
            new_version: new_version.into(),
            version_to_remove: String::new(),
            oat_mode: OatMode::Default,
            protected_app: false,
            use_custom_patch: false,
            platform_fingerprint: String::new(),
            remove_interpret_dir_pending: false,
        }
    }

    pub fn with_versions(mut self, old_version: &str, new_version: &str) -> Self {
        self.old_version = old_version.to_string();
        self.new_version = new_version.to_string();
        self
    }

    pub fn with_old_version(mut self, old_version: &str) -> Self {
        self.old_version = old_version.to_string();
        self
    }

    pub fn with_version_to_remove(mut self, version: &str) -> Self {
        self.version_to_remove = version.to_string();
        self
    }

    pub fn with_oat_mode(mut self, oat_mode: OatMode) -> Self {
        self.oat_mode = oat_mode;
        self
    }

    pub fn with_platform_fingerprint(mut self, fingerprint: &str) -> Self {
        self.platform_fingerprint = fingerprint.to_string();
        self
    }

    pub fn with_remove_interpret_dir_pending(mut self, pending: bool) -> Self {
        self.remove_interpret_dir_pending = pending;
        self
    }

    pub fn with_flags(mut self, protected_app: bool, use_custom_patch: bool) -> Self {
        self.protected_app = protected_app;
        self.use_custom_patch = use_custom_patch;
        self
    }

    pub fn wiped(self) -> Self {
        self.with_versions("", "").with_version_to_remove("")
    }

    pub fn has_removal_marker(&self) -> bool {
        !self.version_to_remove.is_empty()
    }

    fn from_stored(stored: StoredLedger) -> Result<Self, LedgerError> {
        let old_version = stored
            .old_version
            .ok_or_else(|| LedgerError::Corrupted("old_version is missing".to_string()))?;
        let new_version = stored
            .new_version
            .ok_or_else(|| LedgerError::Corrupted("new_version is missing".to_string()))?;
        let raw_mode = stored
            .oat_mode
            .ok_or_else(|| LedgerError::Corrupted("oat_mode is missing".to_string()))?;
        let oat_mode = OatMode::parse(&raw_mode)
            .ok_or_else(|| LedgerError::Corrupted(format!("unknown oat_mode '{raw_mode}'")))?;

        Ok(Self {
            old_version: old_version.trim().to_string(),
            new_version: new_version.trim().to_string(),
            version_to_remove: stored
                .version_to_remove
                .map(|value| value.trim().to_string())
                .unwrap_or_default(),
            oat_mode,
            protected_app: stored.protected_app,
            use_custom_patch: stored.use_custom_patch,
            platform_fingerprint: stored.platform_fingerprint.unwrap_or_default(),
            remove_interpret_dir_pending: stored.remove_interpret_dir_pending,
        })
    }

    fn to_stored(&self) -> StoredLedger {
        StoredLedger {
            old_version: Some(self.old_version.clone()),
            new_version: Some(self.new_version.clone()),
            version_to_remove: Some(self.version_to_remove.clone()),
            oat_mode: Some(self.oat_mode.as_str().to_string()),
            protected_app: self.protected_app,
            use_custom_patch: self.use_custom_patch,
            platform_fingerprint: Some(self.platform_fingerprint.clone()),
            remove_interpret_dir_pending: self.remove_interpret_dir_pending,
        }
    }
}

#[derive(Debug)]
struct LedgerLock {
    _file: File,
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    info_path: PathBuf,
    lock_path: PathBuf,
}

impl LedgerStore {
    pub fn new(layout: &PatchLayout) -> Self {
        Self {
            info_path: layout.ledger_file(),
            lock_path: layout.ledger_lock_file(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.info_path
    }

    pub fn exists(&self) -> bool {
        self.info_path.is_file()
    }

    pub fn read(&self) -> Result<PatchLedger, LedgerError> {
        let _lock = self.lock()?;
        self.read_unlocked()
    }

    pub fn rewrite(&self, ledger: &PatchLedger) -> anyhow::Result<()> {
        let _lock = self.lock()?;
        self.write_unlocked(ledger)
    }

    /// Read, transform and write while holding the lock once.
    pub fn update<F>(&self, change: F) -> Result<PatchLedger, LedgerError>
    where
        F: FnOnce(PatchLedger) -> PatchLedger,
    {
        let _lock = self.lock()?;
        let current = self.read_unlocked()?;
        let next = change(current);
        self.write_unlocked(&next)?;
        Ok(next)
    }

    fn lock(&self) -> anyhow::Result<LedgerLock> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating ledger dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("failed opening ledger lock {}", self.lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed locking {}", self.lock_path.display()))?;
        Ok(LedgerLock { _file: file })
    }

    fn read_unlocked(&self) -> Result<PatchLedger, LedgerError> {
        let raw = match fs::read_to_string(&self.info_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(LedgerError::NotFound(self.info_path.clone()));
            }
            Err(err) => {
                return Err(LedgerError::Io(anyhow!(err).context(format!(
                    "failed reading ledger {}",
                    self.info_path.display()
                ))));
            }
        };
        let stored: StoredLedger = serde_json::from_str(&raw).map_err(|err| {
            LedgerError::Corrupted(format!(
                "failed decoding ledger {}: {}",
                self.info_path.display(),
                err
            ))
        })?;
        PatchLedger::from_stored(stored)
    }

    fn write_unlocked(&self, ledger: &PatchLedger) -> anyhow::Result<()> {
        let payload =
            serde_json::to_string_pretty(&ledger.to_stored()).context("failed encoding ledger")?;
        write_atomic(&self.info_path, payload.as_bytes())?;
        debug!(
            ledger = %self.info_path.display(),
            old_version = %ledger.old_version,
            new_version = %ledger.new_version,
            oat_mode = ledger.oat_mode.as_str(),
            "ledger rewritten"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{LedgerError, LedgerStore, OatMode, PatchLedger};
    use crate::layout::PatchLayout;

    fn store() -> (tempfile::TempDir, LedgerStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::new(&PatchLayout::new(dir.path()));
        (dir, store)
    }

    #[test]
    fn rewrite_then_read_preserves_every_field() {
        let (_dir, store) = store();
        let ledger = PatchLedger::new("aaa", "bbb")
            .with_version_to_remove("aaa")
            .with_oat_mode(OatMode::Transitioning)
            .with_platform_fingerprint("6.1.0-test")
            .with_remove_interpret_dir_pending(true)
            .with_flags(true, false);
        store.rewrite(&ledger).expect("rewrite");

        assert_eq!(store.read().expect("read"), ledger);
    }

    #[test]
    fn missing_file_is_distinct_from_corruption() {
        let (_dir, store) = store();
        assert!(matches!(store.read(), Err(LedgerError::NotFound(_))));

        std::fs::write(store.path(), "{not json").expect("write");
        assert!(matches!(store.read(), Err(LedgerError::Corrupted(_))));
    }

    #[test]
    fn absent_oat_mode_is_corruption() {
        let (_dir, store) = store();
        std::fs::write(
            store.path(),
            r#"{"old_version":"","new_version":"abc123","version_to_remove":""}"#,
        )
        .expect("write");
        match store.read() {
            Err(LedgerError::Corrupted(message)) => assert!(message.contains("oat_mode")),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn null_version_is_corruption() {
        let (_dir, store) = store();
        std::fs::write(
            store.path(),
            r#"{"old_version":null,"new_version":"abc123","oat_mode":"default"}"#,
        )
        .expect("write");
        assert!(matches!(store.read(), Err(LedgerError::Corrupted(_))));
    }

    #[test]
    fn update_applies_change_under_one_lock() {
        let (_dir, store) = store();
        store
            .rewrite(&PatchLedger::new("", "abc123"))
            .expect("rewrite");
        let next = store
            .update(|ledger| {
                let new_version = ledger.new_version.clone();
                ledger.with_version_to_remove(&new_version)
            })
            .expect("update");
        assert_eq!(next.version_to_remove, "abc123");
        assert_eq!(store.read().expect("read").version_to_remove, "abc123");
    }

    #[test]
    fn transitioning_mode_resolves_by_process_role() {
        assert_eq!(OatMode::Transitioning.resolve_for(true), OatMode::Default);
        assert_eq!(OatMode::Transitioning.resolve_for(false), OatMode::Interpret);
        assert_eq!(OatMode::Interpret.resolve_for(true), OatMode::Interpret);
    }
}
