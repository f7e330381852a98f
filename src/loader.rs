use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::bindings::{retarget_all, BindingKind};
use crate::chain_builder::{build_chain, select_strategy, ChainInputs, StrategyKind};
use crate::config::Settings;
use crate::fsutil::{delete_dir_async, is_legal_file};
use crate::host::HostRuntime;
use crate::integrity::{Ed25519PackageVerifier, PackageVerifier, VerifiedPackage};
use crate::layout::{optimize_dir, PatchLayout, INTERPRET_OPTIMIZE_DIR};
use crate::ledger::{LedgerError, LedgerStore, OatMode, PatchLedger};
use crate::process::{PidDirectoryControl, ProcessControl, ProcessRole};
use crate::resolver::{LookupOrder, ResolutionSource};
use crate::safe_mode::{SafeModeStore, SafeModeVerdict, DEFAULT_SAFE_MODE_MAX_COUNT};
use crate::subsystem::{
    check_complete, native_search_dirs, CheckedSubBundle, Subsystem, SubsystemFailure,
    SubsystemFlags,
};

const OTA_INTERPRET_LEVELS: std::ops::Range<u32> = 21..26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStatus {
    Ok,
    Disabled,
    DirNotExist,
    InfoNotExist,
    InfoCorrupted,
    InfoBlank,
    VersionDirectoryNotExist,
    VersionFileNotExist,
    PackageCheckFail,
    SubsystemCheckFail,
    SubsystemLoadFail,
    RewriteInfoFail,
    UncaughtException,
}

impl LoadStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Disabled => -1,
            Self::DirNotExist => -2,
            Self::InfoNotExist => -3,
            Self::InfoCorrupted => -4,
            Self::InfoBlank => -5,
            Self::VersionDirectoryNotExist => -6,
            Self::VersionFileNotExist => -7,
            Self::PackageCheckFail => -8,
            Self::SubsystemCheckFail => -9,
            Self::SubsystemLoadFail => -10,
            Self::RewriteInfoFail => -11,
            Self::UncaughtException => -12,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Disabled => "DISABLED",
            Self::DirNotExist => "DIR_NOT_EXIST",
            Self::InfoNotExist => "INFO_NOT_EXIST",
            Self::InfoCorrupted => "INFO_CORRUPTED",
            Self::InfoBlank => "INFO_BLANK",
            Self::VersionDirectoryNotExist => "VERSION_DIRECTORY_NOT_EXIST",
            Self::VersionFileNotExist => "VERSION_FILE_NOT_EXIST",
            Self::PackageCheckFail => "PACKAGE_CHECK_FAIL",
            Self::SubsystemCheckFail => "SUBSYSTEM_CHECK_FAIL",
            Self::SubsystemLoadFail => "SUBSYSTEM_LOAD_FAIL",
            Self::RewriteInfoFail => "REWRITE_INFO_FAIL",
            Self::UncaughtException => "UNCAUGHT_EXCEPTION",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub result_code: i32,
    pub status: LoadStatus,
    pub subsystem: Option<Subsystem>,
    pub subsystem_failure: Option<SubsystemFailure>,
    pub package_check_code: Option<i32>,
    pub old_version: Option<String>,
    pub new_version: Option<String>,
    pub oat_mode: Option<OatMode>,
    pub system_ota: bool,
    pub elapsed_ms: u64,
    pub protected_app: bool,
    pub use_custom_patch: bool,
    pub package_properties: BTreeMap<String, String>,
    pub loaded_modules: Vec<String>,
    pub native_library_dirs: Vec<String>,
    pub chain_strategy: Option<StrategyKind>,
    pub library_path: Option<String>,
    pub bindings: Vec<BindingKind>,
    pub process: String,
    pub role: ProcessRole,
    pub error: Option<String>,
    pub timestamp: String,
}

impl LoadOutcome {
    fn new(process: &str, role: ProcessRole) -> Self {
        Self {
            result_code: LoadStatus::UncaughtException.code(),
            status: LoadStatus::UncaughtException,
            subsystem: None,
            subsystem_failure: None,
            package_check_code: None,
            old_version: None,
            new_version: None,
            oat_mode: None,
            system_ota: false,
            elapsed_ms: 0,
            protected_app: false,
            use_custom_patch: false,
            package_properties: BTreeMap::new(),
            loaded_modules: Vec::new(),
            native_library_dirs: Vec::new(),
            chain_strategy: None,
            library_path: None,
            bindings: Vec::new(),
            process: process.to_string(),
            role,
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == LoadStatus::Ok
    }

    fn fail(&mut self, status: LoadStatus, error: impl Into<String>) -> LoadStatus {
        self.error = Some(error.into());
        status
    }

    fn fail_subsystem(
        &mut self,
        status: LoadStatus,
        subsystem: Subsystem,
        failure: Option<SubsystemFailure>,
        error: impl Into<String>,
    ) -> LoadStatus {
        self.subsystem = Some(subsystem);
        self.subsystem_failure = failure;
        self.fail(status, error)
    }
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub app_id: String,
    pub process_name: String,
    pub enabled: bool,
    pub subsystems: SubsystemFlags,
    pub safe_mode_max_count: u32,
    pub lookup_order: LookupOrder,
    pub use_delegate_last: bool,
    pub kill_siblings: bool,
}

impl LoaderOptions {
    pub fn new(app_id: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            process_name: process_name.into(),
            enabled: true,
            subsystems: SubsystemFlags::all(),
            safe_mode_max_count: DEFAULT_SAFE_MODE_MAX_COUNT,
            lookup_order: LookupOrder::default(),
            use_delegate_last: true,
            kill_siblings: true,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            app_id: settings.app_id.clone(),
            process_name: settings.process_name.clone(),
            enabled: settings.patch.enabled,
            subsystems: settings.patch.subsystems,
            safe_mode_max_count: settings.patch.safe_mode_max_count,
            lookup_order: settings.patch.lookup_order,
            use_delegate_last: settings.patch.use_delegate_last,
            kill_siblings: settings.patch.kill_siblings,
        }
    }

    fn role(&self) -> ProcessRole {
        ProcessRole::classify(&self.app_id, &self.process_name)
    }
}

#[derive(Debug, Default)]
struct CheckedBundles {
    native: Option<CheckedSubBundle>,
    code: Option<CheckedSubBundle>,
    alt_runtime: Option<CheckedSubBundle>,
    resources: Option<CheckedSubBundle>,
}

impl CheckedBundles {
    fn slot(&mut self, subsystem: Subsystem) -> &mut Option<CheckedSubBundle> {
        match subsystem {
            Subsystem::Native => &mut self.native,
            Subsystem::Code => &mut self.code,
            Subsystem::AltRuntime => &mut self.alt_runtime,
            Subsystem::Resources => &mut self.resources,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingCommit {
    ledger: PatchLedger,
    version_changed: bool,
    oat_mode_changed: bool,
}

impl PendingCommit {
    fn is_needed(&self) -> bool {
        self.version_changed || self.oat_mode_changed
    }
}

pub struct PatchLoader {
    layout: PatchLayout,
    ledger: LedgerStore,
    safe_mode: SafeModeStore,
    verifier: Box<dyn PackageVerifier>,
    host: Arc<dyn HostRuntime>,
    processes: Arc<dyn ProcessControl>,
    options: LoaderOptions,
    outcome: OnceLock<LoadOutcome>,
    cleanup: Mutex<Vec<JoinHandle<()>>>,
}

impl PatchLoader {
    pub fn new(
        layout: PatchLayout,
        options: LoaderOptions,
        host: Arc<dyn HostRuntime>,
        verifier: Box<dyn PackageVerifier>,
    ) -> Self {
        Self {
            ledger: LedgerStore::new(&layout),
            safe_mode: SafeModeStore::new(&layout, options.safe_mode_max_count),
            processes: Arc::new(PidDirectoryControl::new(&layout)),
            layout,
            verifier,
            host,
            options,
            outcome: OnceLock::new(),
            cleanup: Mutex::new(Vec::new()),
        }
    }

    pub fn from_settings(settings: &Settings, host: Arc<dyn HostRuntime>) -> Self {
        let verifier = Ed25519PackageVerifier::new(settings.patch.trusted_ed25519_public_key.clone())
            .with_expected_base_id(settings.patch.base_id.clone())
            .with_enabled_subsystems(settings.patch.subsystems);
        Self::new(
            PatchLayout::new(&settings.patch_root),
            LoaderOptions::from_settings(settings),
            host,
            Box::new(verifier),
        )
    }

    pub fn with_process_control(mut self, processes: Arc<dyn ProcessControl>) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_safe_mode(mut self, safe_mode: SafeModeStore) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    pub fn layout(&self) -> &PatchLayout {
        &self.layout
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn safe_mode(&self) -> &SafeModeStore {
        &self.safe_mode
    }

    /// Runs the load pass the first time it is called. Later calls return the
    /// first outcome without touching storage.
    pub fn try_load(&self) -> LoadOutcome {
        self.outcome.get_or_init(|| self.run()).clone()
    }

    pub fn wait_for_cleanup(&self) {
        let handles = match self.cleanup.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("stale directory cleanup thread panicked");
            }
        }
    }

    #[instrument(
        name = "loader.try_load",
        skip(self),
        fields(process = %self.options.process_name, app_id = %self.options.app_id)
    )]
    fn run(&self) -> LoadOutcome {
        let started = Instant::now();
        let mut outcome = LoadOutcome::new(&self.options.process_name, self.options.role());

        let status = match panic::catch_unwind(AssertUnwindSafe(|| self.run_stages(&mut outcome))) {
            Ok(Ok(())) => LoadStatus::Ok,
            Ok(Err(status)) => status,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                outcome.fail(
                    LoadStatus::UncaughtException,
                    format!("load pass panicked: {message}"),
                )
            }
        };

        outcome.status = status;
        outcome.result_code = status.code();
        outcome.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if status == LoadStatus::Ok {
            info!(
                version = outcome.old_version.as_deref().unwrap_or(""),
                elapsed_ms = outcome.elapsed_ms,
                "patch loaded"
            );
        } else {
            warn!(
                status = status.as_str(),
                code = status.code(),
                subsystem = outcome.subsystem.map(Subsystem::as_str),
                error = outcome.error.as_deref().unwrap_or(""),
                "patch load stopped"
            );
        }
        outcome
    }

    fn run_stages(&self, outcome: &mut LoadOutcome) -> Result<(), LoadStatus> {
        let role = self.check_eligibility(outcome)?;
        let main = role.is_main();

        if !self.layout.root().is_dir() {
            return Err(outcome.fail(
                LoadStatus::DirNotExist,
                format!("patch root does not exist: {}", self.layout.root().display()),
            ));
        }
        if !self.ledger.exists() {
            return Err(outcome.fail(
                LoadStatus::InfoNotExist,
                format!("ledger does not exist: {}", self.ledger.path().display()),
            ));
        }

        if let Err(err) = self.processes.register(&self.options.process_name) {
            warn!(error = %format!("{err:#}"), "failed registering process for sibling control");
        }

        let ledger = self.read_ledger(outcome)?;
        outcome.old_version = Some(ledger.old_version.clone());
        outcome.new_version = Some(ledger.new_version.clone());
        outcome.protected_app = ledger.protected_app;
        outcome.use_custom_patch = ledger.use_custom_patch;

        let ledger = if main {
            self.reconcile_stale_versions(ledger, outcome)?
        } else {
            ledger
        };

        let version_changed = ledger.new_version != ledger.old_version;
        let effective = if main && version_changed {
            ledger.new_version.clone()
        } else {
            ledger.old_version.clone()
        };
        if effective.is_empty() {
            return Err(outcome.fail(LoadStatus::InfoBlank, "no patch version to load"));
        }
        let oat_mode = ledger.oat_mode.resolve_for(main);
        outcome.oat_mode = Some(oat_mode);
        debug!(
            version = %effective,
            version_changed,
            oat_mode = oat_mode.as_str(),
            "patch version selected"
        );

        let version_dir = self
            .layout
            .version_dir(&effective)
            .filter(|dir| dir.is_dir())
            .ok_or_else(|| {
                outcome.fail(
                    LoadStatus::VersionDirectoryNotExist,
                    format!("version directory for '{effective}' does not exist"),
                )
            })?;
        let version_file = self
            .layout
            .version_file(&effective)
            .filter(|file| is_legal_file(file))
            .ok_or_else(|| {
                outcome.fail(
                    LoadStatus::VersionFileNotExist,
                    format!("version file for '{effective}' is missing or empty"),
                )
            })?;

        let package = match self.verifier.verify(&version_file) {
            Ok(package) => package,
            Err(failure) => {
                outcome.package_check_code = Some(failure.status.code());
                return Err(outcome.fail(LoadStatus::PackageCheckFail, failure.to_string()));
            }
        };
        outcome.package_properties = package.properties.clone();

        let checked = self.check_subsystems(&version_dir, &package, outcome)?;

        let current_fingerprint = self.host.platform_fingerprint();
        let system_ota = is_system_ota(
            &ledger.platform_fingerprint,
            &current_fingerprint,
            self.host.capability_level(),
        );
        outcome.system_ota = system_ota;

        let mut pending = PendingCommit {
            ledger: ledger.clone(),
            version_changed: main && version_changed,
            oat_mode_changed: main && ledger.oat_mode == OatMode::Transitioning,
        };
        if pending.version_changed {
            pending.ledger = pending
                .ledger
                .with_old_version(&effective)
                .with_platform_fingerprint(&current_fingerprint);
        }
        if pending.oat_mode_changed {
            pending.ledger = pending
                .ledger
                .with_oat_mode(oat_mode)
                .with_remove_interpret_dir_pending(true);
        }

        self.safe_mode_gate(main, &ledger, &version_dir, outcome)?;

        self.activate(
            checked,
            &version_dir,
            oat_mode,
            system_ota,
            &current_fingerprint,
            &mut pending,
            outcome,
        )?;

        if main && pending.is_needed() {
            self.commit(&pending, outcome)?;
            self.terminate_siblings();
        }

        outcome.old_version = Some(effective);
        Ok(())
    }

    fn check_eligibility(&self, outcome: &mut LoadOutcome) -> Result<ProcessRole, LoadStatus> {
        if !self.options.enabled {
            return Err(outcome.fail(LoadStatus::Disabled, "patching is disabled"));
        }
        let role = self.options.role();
        if role == ProcessRole::PatchReceiver {
            return Err(outcome.fail(
                LoadStatus::Disabled,
                "the patch-receiving process never loads patches",
            ));
        }
        Ok(role)
    }

    fn read_ledger(&self, outcome: &mut LoadOutcome) -> Result<PatchLedger, LoadStatus> {
        match self.ledger.read() {
            Ok(ledger) => Ok(ledger),
            Err(LedgerError::NotFound(path)) => Err(outcome.fail(
                LoadStatus::InfoNotExist,
                format!("ledger does not exist: {}", path.display()),
            )),
            Err(err) => Err(outcome.fail(LoadStatus::InfoCorrupted, format!("{err:#}"))),
        }
    }

    fn reconcile_stale_versions(
        &self,
        ledger: PatchLedger,
        outcome: &mut LoadOutcome,
    ) -> Result<PatchLedger, LoadStatus> {
        let mut ledger = ledger;

        if ledger.has_removal_marker() {
            let mut removal = None;
            let next = self.update_ledger(outcome, |current| {
                let (next, applied) = apply_removal_marker(current);
                removal = applied;
                next
            })?;
            if let Some(removal) = removal {
                info!(
                    marker = %removal.version,
                    old_version = %next.old_version,
                    new_version = %next.new_version,
                    "removal marker processed"
                );
                if removal.kill_siblings {
                    self.terminate_siblings();
                }
                if let Some(dir) = self.layout.version_dir(&removal.version) {
                    self.delete_later(dir);
                }
            }
            outcome.old_version = Some(next.old_version.clone());
            outcome.new_version = Some(next.new_version.clone());
            ledger = next;
        }

        if ledger.remove_interpret_dir_pending {
            let mut was_pending = false;
            let next = self.update_ledger(outcome, |current| {
                was_pending = current.remove_interpret_dir_pending;
                current.with_remove_interpret_dir_pending(false)
            })?;
            if was_pending {
                self.terminate_siblings();
                if let Some(dir) = self.layout.version_dir(&next.new_version) {
                    self.delete_later(optimize_dir(&dir, INTERPRET_OPTIMIZE_DIR));
                }
            }
            ledger = next;
        }

        Ok(ledger)
    }

    fn check_subsystems(
        &self,
        version_dir: &Path,
        package: &VerifiedPackage,
        outcome: &mut LoadOutcome,
    ) -> Result<CheckedBundles, LoadStatus> {
        let alt_active = self.host.alt_runtime_active();
        let mut checked = CheckedBundles::default();
        for subsystem in Subsystem::ALL {
            let applicable = match subsystem {
                Subsystem::Code => !alt_active,
                Subsystem::AltRuntime => alt_active,
                Subsystem::Native | Subsystem::Resources => true,
            };
            if !applicable || !self.options.subsystems.is_enabled(subsystem) {
                continue;
            }
            match check_complete(subsystem, version_dir, package) {
                Ok(bundle) => *checked.slot(subsystem) = Some(bundle),
                Err(err) => {
                    return Err(outcome.fail_subsystem(
                        LoadStatus::SubsystemCheckFail,
                        err.subsystem,
                        Some(err.failure),
                        err.detail,
                    ));
                }
            }
        }
        Ok(checked)
    }

    fn safe_mode_gate(
        &self,
        main: bool,
        ledger: &PatchLedger,
        version_dir: &Path,
        outcome: &mut LoadOutcome,
    ) -> Result<(), LoadStatus> {
        let attempts = match self.safe_mode.check_and_increment(&self.options.process_name) {
            Ok(SafeModeVerdict::Proceed { attempt }) => {
                debug!(attempt, "safe mode attempt recorded");
                return Ok(());
            }
            Ok(SafeModeVerdict::Tripped { attempts }) => attempts,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "safe mode counter unavailable");
                return Ok(());
            }
        };

        if main {
            if let Err(err) = self.ledger.update(PatchLedger::wiped) {
                warn!(error = %format!("{err:#}"), "failed wiping ledger after safe mode trip");
            }
            self.terminate_siblings();
            self.delete_later(version_dir.to_path_buf());
            return Err(outcome.fail(
                LoadStatus::UncaughtException,
                format!("safe mode tripped after {attempts} unacknowledged attempts; patch removed"),
            ));
        }

        let bad_version = ledger.new_version.clone();
        match self
            .ledger
            .update(|current| current.with_version_to_remove(&bad_version))
        {
            Ok(_) => warn!(version = %bad_version, "safe mode tripped; version marked for removal"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed marking version for removal"),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn activate(
        &self,
        checked: CheckedBundles,
        version_dir: &Path,
        oat_mode: OatMode,
        system_ota: bool,
        current_fingerprint: &str,
        pending: &mut PendingCommit,
        outcome: &mut LoadOutcome,
    ) -> Result<(), LoadStatus> {
        let mut patched_library_dirs = Vec::new();
        if let Some(native) = checked.native.filter(|bundle| !bundle.is_empty()) {
            patched_library_dirs = native_search_dirs(&native);
            if let Err(err) = self.host.install_native_dirs(&patched_library_dirs) {
                return Err(outcome.fail_subsystem(
                    LoadStatus::SubsystemLoadFail,
                    Subsystem::Native,
                    None,
                    format!("{err:#}"),
                ));
            }
            outcome.native_library_dirs = patched_library_dirs
                .iter()
                .map(|dir| dir.display().to_string())
                .collect();
        }

        if let Some(code) = checked.code.filter(|bundle| !bundle.is_empty()) {
            let load_mode = if system_ota { OatMode::Interpret } else { oat_mode };
            let loaded = self.activate_code(&code, version_dir, load_mode, patched_library_dirs, outcome);

            if system_ota {
                let settled = if loaded.is_ok() {
                    OatMode::Interpret
                } else {
                    OatMode::Default
                };
                let fingerprint = current_fingerprint.to_string();
                if let Err(err) = self.ledger.update(|current| {
                    current
                        .with_platform_fingerprint(&fingerprint)
                        .with_oat_mode(settled)
                }) {
                    return Err(outcome.fail(
                        LoadStatus::RewriteInfoFail,
                        format!("failed recording platform update: {err:#}"),
                    ));
                }
                pending.ledger = pending
                    .ledger
                    .clone()
                    .with_platform_fingerprint(&fingerprint)
                    .with_oat_mode(settled);
                pending.oat_mode_changed = false;
                outcome.oat_mode = Some(settled);
                info!(oat_mode = settled.as_str(), "platform update detected; ledger refreshed");
            }

            if let Err(err) = loaded {
                return Err(outcome.fail_subsystem(
                    LoadStatus::SubsystemLoadFail,
                    Subsystem::Code,
                    None,
                    err,
                ));
            }
        }

        if let Some(alt) = checked.alt_runtime.filter(|bundle| !bundle.is_empty()) {
            if let Err(err) = self.host.load_alt_runtime(&alt.paths()) {
                return Err(outcome.fail_subsystem(
                    LoadStatus::SubsystemLoadFail,
                    Subsystem::AltRuntime,
                    None,
                    format!("{err:#}"),
                ));
            }
            outcome
                .loaded_modules
                .extend(alt.entries.iter().map(|entry| entry.name.clone()));
        }

        if let Some(resources) = checked.resources.filter(|bundle| !bundle.is_empty()) {
            if let Err(err) = self.host.install_resources(&resources.paths()) {
                return Err(outcome.fail_subsystem(
                    LoadStatus::SubsystemLoadFail,
                    Subsystem::Resources,
                    None,
                    format!("{err:#}"),
                ));
            }
        }

        Ok(())
    }

    fn activate_code(
        &self,
        code: &CheckedSubBundle,
        version_dir: &Path,
        load_mode: OatMode,
        patched_library_dirs: Vec<PathBuf>,
        outcome: &mut LoadOutcome,
    ) -> Result<(), String> {
        let inputs = ChainInputs {
            original: self.host.original_resolver(),
            system: self.host.system_resolver(),
            plugin: self.host.plugin_resolver(),
            module_paths: code.paths(),
            cache_dir: Some(optimize_dir(version_dir, load_mode.optimize_dir_name())),
            patched_library_dirs,
            original_library_dirs: self.host.original_library_dirs(),
            lookup_order: self.options.lookup_order,
        };
        let strategy = select_strategy(self.host.capability_level(), self.options.use_delegate_last);
        outcome.chain_strategy = Some(strategy.kind());

        let chain = build_chain(strategy.as_ref(), &inputs).map_err(|err| format!("{err:#}"))?;
        outcome.library_path = Some(chain.library_path().to_string());

        let installed: Arc<dyn ResolutionSource> = chain;
        let bound = retarget_all(self.host.as_ref(), installed)
            .map_err(|(kind, err)| format!("binding {} could not be retargeted: {err}", kind.as_str()))?;
        outcome.bindings = bound;
        outcome
            .loaded_modules
            .extend(code.entries.iter().map(|entry| entry.name.clone()));
        Ok(())
    }

    fn commit(&self, pending: &PendingCommit, outcome: &mut LoadOutcome) -> Result<(), LoadStatus> {
        let target = pending.ledger.clone();
        let result = self.ledger.update(|current| {
            let cleanup = current.remove_interpret_dir_pending || target.remove_interpret_dir_pending;
            current
                .with_old_version(&target.old_version)
                .with_oat_mode(target.oat_mode)
                .with_platform_fingerprint(&target.platform_fingerprint)
                .with_remove_interpret_dir_pending(cleanup)
        });
        match result {
            Ok(committed) => {
                info!(
                    old_version = %committed.old_version,
                    oat_mode = committed.oat_mode.as_str(),
                    "ledger committed"
                );
                Ok(())
            }
            Err(err) => Err(outcome.fail(
                LoadStatus::RewriteInfoFail,
                format!("failed committing ledger: {err:#}"),
            )),
        }
    }

    fn update_ledger<F>(&self, outcome: &mut LoadOutcome, change: F) -> Result<PatchLedger, LoadStatus>
    where
        F: FnOnce(PatchLedger) -> PatchLedger,
    {
        self.ledger.update(change).map_err(|err| {
            outcome.fail(
                LoadStatus::RewriteInfoFail,
                format!("failed rewriting ledger: {err:#}"),
            )
        })
    }

    fn terminate_siblings(&self) {
        if self.options.kill_siblings {
            self.processes.kill_siblings();
        }
    }

    fn delete_later(&self, dir: PathBuf) {
        if let Some(handle) = delete_dir_async(dir) {
            match self.cleanup.lock() {
                Ok(mut handles) => handles.push(handle),
                Err(poisoned) => poisoned.into_inner().push(handle),
            }
        }
    }
}

impl Drop for PatchLoader {
    fn drop(&mut self) {
        if let Err(err) = self.processes.unregister() {
            debug!(error = %format!("{err:#}"), "failed removing process registration");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Removal {
    version: String,
    kill_siblings: bool,
}

fn apply_removal_marker(ledger: PatchLedger) -> (PatchLedger, Option<Removal>) {
    if !ledger.has_removal_marker() {
        return (ledger, None);
    }
    let marker = ledger.version_to_remove.clone();
    let (next, kill_siblings) = if marker == ledger.new_version {
        let loaded_before = ledger.new_version == ledger.old_version;
        let fallback = if loaded_before {
            String::new()
        } else {
            ledger.old_version.clone()
        };
        (ledger.with_versions(&fallback, &fallback), loaded_before)
    } else if marker == ledger.old_version {
        let new_version = ledger.new_version.clone();
        (ledger.with_old_version(&new_version), true)
    } else {
        return (ledger.with_version_to_remove(""), None);
    };
    let removal = Removal {
        version: marker,
        kill_siblings,
    };
    (next.with_version_to_remove(""), Some(removal))
}

pub fn is_system_ota(stored_fingerprint: &str, current_fingerprint: &str, capability_level: u32) -> bool {
    !stored_fingerprint.is_empty()
        && !current_fingerprint.is_empty()
        && stored_fingerprint != current_fingerprint
        && OTA_INTERPRET_LEVELS.contains(&capability_level)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
