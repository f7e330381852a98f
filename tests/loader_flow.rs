use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signer, SigningKey};
use tempfile::TempDir;

use rusty_patch::bindings::{BindingError, BindingKind};
use rusty_patch::chain_builder::StrategyKind;
use rusty_patch::fsutil::{atomic_tmp_path, sha256_hex};
use rusty_patch::host::StandaloneHost;
use rusty_patch::integrity::{BundleManifest, Ed25519PackageVerifier, ManifestEntry, SubBundleManifest};
use rusty_patch::layout::{signature_path, PatchLayout};
use rusty_patch::ledger::{LedgerStore, OatMode, PatchLedger};
use rusty_patch::loader::{LoadStatus, LoaderOptions, PatchLoader};
use rusty_patch::process::RecordingProcessControl;
use rusty_patch::resolver::{LookupError, ModuleResolver, ResolutionSource};
use rusty_patch::safe_mode::SafeModeStore;
use rusty_patch::subsystem::{Subsystem, SubsystemFailure};

const APP_ID: &str = "com.example.app";
const VERSION: &str = "abc123";

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

fn public_key_b64() -> String {
    general_purpose::STANDARD.encode(signing_key().verifying_key().as_bytes())
}

fn module_json(definitions: &[(&str, &str)]) -> Vec<u8> {
    let encoded = definitions
        .iter()
        .map(|(name, body)| {
            (
                name.to_string(),
                serde_json::Value::String(general_purpose::STANDARD.encode(body)),
            )
        })
        .collect::<serde_json::Map<_, _>>();
    serde_json::to_vec(&serde_json::json!({ "definitions": encoded })).expect("encode module")
}

struct Fixture {
    dir: TempDir,
    layout: PatchLayout,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = PatchLayout::new(dir.path().join("patch"));
        fs::create_dir_all(layout.root()).expect("create patch root");
        Self { dir, layout }
    }

    fn ledger(&self) -> LedgerStore {
        LedgerStore::new(&self.layout)
    }

    fn write_ledger(&self, ledger: &PatchLedger) {
        self.ledger().rewrite(ledger).expect("write ledger");
    }

    fn read_ledger(&self) -> PatchLedger {
        self.ledger().read().expect("read ledger")
    }

    fn ledger_bytes(&self) -> Vec<u8> {
        fs::read(self.layout.ledger_file()).expect("read ledger bytes")
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.layout.version_dir(version).expect("valid version")
    }

    /// Writes a signed bundle with code, alt runtime, native and resource sub-bundles.
    fn write_bundle(&self, version: &str) -> PathBuf {
        let version_dir = self.version_dir(version);
        let files: [(Subsystem, &str, Vec<u8>); 4] = [
            (
                Subsystem::Code,
                "main.module",
                module_json(&[("app.Main", "patched main"), ("app.Feature", "patched feature")]),
            ),
            (
                Subsystem::AltRuntime,
                "hotfix.module",
                module_json(&[("app.Main", "hot-swapped main")]),
            ),
            (Subsystem::Native, "arm64/libcore.so", b"\x7fELF patched".to_vec()),
            (Subsystem::Resources, "main.arsc", b"resources v2".to_vec()),
        ];

        let mut manifest = BundleManifest {
            format: 1,
            patch_id: version.to_string(),
            base_id: None,
            properties: BTreeMap::from([("channel".to_string(), "beta".to_string())]),
            subsystems: Default::default(),
        };
        for (subsystem, name, bytes) in files {
            let path = version_dir.join(subsystem.dir_name()).join(name);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir sub-bundle");
            fs::write(&path, &bytes).expect("write entry");
            manifest.subsystems.set(
                subsystem,
                SubBundleManifest::from_entries(vec![ManifestEntry {
                    name: name.to_string(),
                    sha256: sha256_hex(&bytes),
                }]),
            );
        }

        let bundle = self.layout.version_file(version).expect("version file");
        let bytes = serde_json::to_vec_pretty(&manifest).expect("encode manifest");
        fs::write(&bundle, &bytes).expect("write bundle");
        fs::write(signature_path(&bundle), signing_key().sign(&bytes).to_bytes())
            .expect("write signature");
        version_dir
    }

    fn host(&self, level: u32, fingerprint: &str) -> StandaloneHost {
        let original_module = self.dir.path().join("app/code/base.module");
        fs::create_dir_all(original_module.parent().expect("parent")).expect("mkdir app");
        fs::write(
            &original_module,
            module_json(&[("app.Main", "original main"), ("app.Legacy", "original legacy")]),
        )
        .expect("write original module");
        let original = ModuleResolver::from_modules("original", &[original_module], None)
            .expect("load original");
        StandaloneHost::new(
            level,
            fingerprint,
            Arc::new(original),
            Arc::new(ModuleResolver::empty("system")),
        )
        .with_original_library_dirs(vec![Some(self.dir.path().join("app/lib")), None])
    }

    fn loader(
        &self,
        process: &str,
        host: Arc<StandaloneHost>,
        control: Arc<RecordingProcessControl>,
    ) -> PatchLoader {
        PatchLoader::new(
            self.layout.clone(),
            LoaderOptions::new(APP_ID, process),
            host,
            Box::new(Ed25519PackageVerifier::new(Some(public_key_b64()))),
        )
        .with_process_control(control)
    }
}

#[test]
fn first_load_of_new_version_commits_ledger_and_signals_siblings() {
    let fixture = Fixture::new();
    let version_dir = fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("", VERSION));

    let host = Arc::new(fixture.host(34, "build-1"));
    let control = Arc::new(RecordingProcessControl::default());
    let loader = fixture.loader(APP_ID, host.clone(), control.clone());
    let outcome = loader.try_load();

    assert_eq!(outcome.status, LoadStatus::Ok, "{:?}", outcome.error);
    assert_eq!(outcome.result_code, 0);
    assert_eq!(outcome.old_version.as_deref(), Some(VERSION));
    assert_eq!(outcome.chain_strategy, Some(StrategyKind::DelegateLast));
    assert_eq!(outcome.loaded_modules, vec!["main.module".to_string()]);
    assert_eq!(
        outcome.package_properties.get("channel").map(String::as_str),
        Some("beta")
    );
    assert!(outcome.bindings.contains(&BindingKind::ThreadResolver));
    assert!(control.kill_calls() >= 1);

    let ledger = fixture.read_ledger();
    assert_eq!(ledger.old_version, VERSION);
    assert_eq!(ledger.new_version, VERSION);
    assert_eq!(ledger.platform_fingerprint, "build-1");

    let chain = host.current_resolver().expect("chain installed");
    assert_eq!(chain.find_definition("app.Main").expect("main").payload, b"patched main");
    assert_eq!(chain.find_definition("app.Legacy").expect("legacy").origin, "original");
    assert_eq!(
        chain.find_definition("app.Missing"),
        Err(LookupError::NotFound("app.Missing".to_string()))
    );

    let native_dirs = host.native_dirs();
    assert_eq!(native_dirs.first(), Some(&version_dir.join("lib")));
    assert!(native_dirs.contains(&version_dir.join("lib/arm64")));
    assert_eq!(host.resource_archives(), vec![version_dir.join("res/main.arsc")]);
    assert!(version_dir.join("odex/main.module.cache").is_file());
}

#[test]
fn ledger_without_oat_mode_is_corrupted_and_never_rewritten() {
    let fixture = Fixture::new();
    fixture.write_bundle(VERSION);
    let raw = br#"{"old_version":"","new_version":"abc123"}"#;
    fs::write(fixture.layout.ledger_file(), raw).expect("write ledger");

    let control = Arc::new(RecordingProcessControl::default());
    let loader = fixture.loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone());
    let outcome = loader.try_load();

    assert_eq!(outcome.status, LoadStatus::InfoCorrupted);
    assert_eq!(outcome.result_code, -4);
    assert_eq!(fixture.ledger_bytes(), raw.to_vec());
    assert_eq!(control.kill_calls(), 0);
}

#[test]
fn equal_versions_load_without_deleting_anything() {
    let fixture = Fixture::new();
    let version_dir = fixture.write_bundle(VERSION);
    let garbage_dir = fixture.write_bundle("old00001");
    fixture.write_ledger(&PatchLedger::new(VERSION, VERSION));
    let before = fixture.ledger_bytes();

    let control = Arc::new(RecordingProcessControl::default());
    let loader = fixture.loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone());
    let outcome = loader.try_load();
    loader.wait_for_cleanup();

    assert_eq!(outcome.status, LoadStatus::Ok, "{:?}", outcome.error);
    assert!(version_dir.is_dir());
    assert!(garbage_dir.is_dir());
    assert_eq!(control.kill_calls(), 0);
    assert_eq!(fixture.ledger_bytes(), before);
}

#[test]
fn repeated_load_is_idempotent_and_does_not_touch_the_ledger() {
    let fixture = Fixture::new();
    fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("", VERSION));

    let control = Arc::new(RecordingProcessControl::default());
    let first = fixture.loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone());
    let outcome = first.try_load();
    assert_eq!(outcome.status, LoadStatus::Ok, "{:?}", outcome.error);
    let again = first.try_load();
    assert_eq!(again.timestamp, outcome.timestamp);

    let inode = fs::metadata(fixture.layout.ledger_file()).expect("meta").ino();
    let bytes = fixture.ledger_bytes();

    let restarted = fixture.loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control);
    let outcome = restarted.try_load();
    assert_eq!(outcome.status, LoadStatus::Ok, "{:?}", outcome.error);
    assert_eq!(fs::metadata(fixture.layout.ledger_file()).expect("meta").ino(), inode);
    assert_eq!(fixture.ledger_bytes(), bytes);
}

#[test]
fn corrupted_sub_bundle_fails_that_subsystem_and_keeps_ledger() {
    let fixture = Fixture::new();
    let version_dir = fixture.write_bundle(VERSION);
    fs::write(version_dir.join("res/main.arsc"), b"tampered").expect("tamper");
    fixture.write_ledger(&PatchLedger::new("", VERSION));
    let before = fixture.ledger_bytes();

    let control = Arc::new(RecordingProcessControl::default());
    let loader = fixture.loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone());
    let outcome = loader.try_load();

    assert_eq!(outcome.status, LoadStatus::SubsystemCheckFail);
    assert_eq!(outcome.result_code, -9);
    assert_eq!(outcome.subsystem, Some(Subsystem::Resources));
    assert_eq!(outcome.subsystem_failure, Some(SubsystemFailure::ChecksumMismatch));
    assert_eq!(fixture.ledger_bytes(), before);
    assert_eq!(control.kill_calls(), 0);
}

#[test]
fn safe_mode_trip_in_main_process_wipes_ledger_and_deletes_version() {
    let fixture = Fixture::new();
    let version_dir = fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new(VERSION, VERSION));
    let control = Arc::new(RecordingProcessControl::default());

    let first = fixture
        .loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone())
        .with_safe_mode(SafeModeStore::new(&fixture.layout, 1));
    assert_eq!(first.try_load().status, LoadStatus::Ok);

    let second = fixture
        .loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone())
        .with_safe_mode(SafeModeStore::new(&fixture.layout, 1));
    let outcome = second.try_load();
    second.wait_for_cleanup();

    assert_eq!(outcome.status, LoadStatus::UncaughtException);
    assert_eq!(outcome.result_code, -12);
    assert!(!version_dir.exists());
    assert!(control.kill_calls() >= 1);
    let ledger = fixture.read_ledger();
    assert_eq!(ledger.old_version, "");
    assert_eq!(ledger.new_version, "");
    assert_eq!(ledger.version_to_remove, "");
}

#[test]
fn safe_mode_trip_in_secondary_process_marks_version_for_main_to_remove() {
    let fixture = Fixture::new();
    let version_dir = fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new(VERSION, VERSION));
    let control = Arc::new(RecordingProcessControl::default());
    let secondary = format!("{APP_ID}:push");

    for _ in 0..2 {
        let loader = fixture
            .loader(&secondary, Arc::new(fixture.host(34, "build-1")), control.clone())
            .with_safe_mode(SafeModeStore::new(&fixture.layout, 1));
        assert_eq!(loader.try_load().status, LoadStatus::Ok);
    }
    assert_eq!(fixture.read_ledger().version_to_remove, VERSION);

    let main = fixture.loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone());
    let outcome = main.try_load();
    main.wait_for_cleanup();

    assert_eq!(outcome.status, LoadStatus::InfoBlank);
    assert!(!version_dir.exists());
    assert!(control.kill_calls() >= 1);
    let ledger = fixture.read_ledger();
    assert_eq!(ledger.old_version, "");
    assert_eq!(ledger.new_version, "");
    assert!(!ledger.has_removal_marker());
}

#[test]
fn removal_marker_on_old_version_promotes_new_and_deletes_old() {
    let fixture = Fixture::new();
    let old_dir = fixture.write_bundle("old00001");
    let new_dir = fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("old00001", VERSION).with_version_to_remove("old00001"));

    let control = Arc::new(RecordingProcessControl::default());
    let loader = fixture.loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone());
    let outcome = loader.try_load();
    loader.wait_for_cleanup();

    assert_eq!(outcome.status, LoadStatus::Ok, "{:?}", outcome.error);
    assert_eq!(outcome.old_version.as_deref(), Some(VERSION));
    assert!(!old_dir.exists());
    assert!(new_dir.is_dir());
    assert!(control.kill_calls() >= 1);
    let ledger = fixture.read_ledger();
    assert_eq!(ledger.old_version, VERSION);
    assert!(!ledger.has_removal_marker());
}

#[test]
fn disabled_and_patch_receiving_processes_never_load() {
    let fixture = Fixture::new();
    fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("", VERSION));
    let before = fixture.ledger_bytes();

    let mut options = LoaderOptions::new(APP_ID, APP_ID);
    options.enabled = false;
    let disabled = PatchLoader::new(
        fixture.layout.clone(),
        options,
        Arc::new(fixture.host(34, "build-1")),
        Box::new(Ed25519PackageVerifier::new(Some(public_key_b64()))),
    )
    .with_process_control(Arc::new(RecordingProcessControl::default()));
    assert_eq!(disabled.try_load().result_code, -1);

    let receiver = fixture.loader(
        &format!("{APP_ID}:patch"),
        Arc::new(fixture.host(34, "build-1")),
        Arc::new(RecordingProcessControl::default()),
    );
    assert_eq!(receiver.try_load().status, LoadStatus::Disabled);
    assert_eq!(fixture.ledger_bytes(), before);
}

#[test]
fn missing_storage_is_reported_without_creating_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = PatchLayout::new(dir.path().join("absent"));
    let fixture = Fixture::new();
    let loader = PatchLoader::new(
        layout.clone(),
        LoaderOptions::new(APP_ID, APP_ID),
        Arc::new(fixture.host(34, "build-1")),
        Box::new(Ed25519PackageVerifier::new(Some(public_key_b64()))),
    );
    assert_eq!(loader.try_load().status, LoadStatus::DirNotExist);
    assert!(!layout.root().exists());

    let no_ledger = fixture.loader(
        APP_ID,
        Arc::new(fixture.host(34, "build-1")),
        Arc::new(RecordingProcessControl::default()),
    );
    assert_eq!(no_ledger.try_load().status, LoadStatus::InfoNotExist);
}

#[test]
fn missing_version_directory_and_file_are_distinguished() {
    let fixture = Fixture::new();
    fixture.write_ledger(&PatchLedger::new(VERSION, VERSION));
    let control = Arc::new(RecordingProcessControl::default());

    let outcome = fixture
        .loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone())
        .try_load();
    assert_eq!(outcome.status, LoadStatus::VersionDirectoryNotExist);

    fs::create_dir_all(fixture.version_dir(VERSION)).expect("mkdir version");
    let outcome = fixture
        .loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control)
        .try_load();
    assert_eq!(outcome.status, LoadStatus::VersionFileNotExist);
    assert_eq!(outcome.result_code, -7);
}

#[test]
fn bundle_signed_by_another_key_fails_package_check() {
    let fixture = Fixture::new();
    fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("", VERSION));
    let before = fixture.ledger_bytes();

    let other = SigningKey::from_bytes(&[9u8; 32]);
    let loader = PatchLoader::new(
        fixture.layout.clone(),
        LoaderOptions::new(APP_ID, APP_ID),
        Arc::new(fixture.host(34, "build-1")),
        Box::new(Ed25519PackageVerifier::new(Some(
            general_purpose::STANDARD.encode(other.verifying_key().as_bytes()),
        ))),
    )
    .with_process_control(Arc::new(RecordingProcessControl::default()));
    let outcome = loader.try_load();

    assert_eq!(outcome.status, LoadStatus::PackageCheckFail);
    assert_eq!(outcome.package_check_code, Some(-3));
    assert_eq!(fixture.ledger_bytes(), before);
}

#[test]
fn required_binding_failure_stops_activation_without_commit() {
    let fixture = Fixture::new();
    fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("", VERSION));

    let host = Arc::new(fixture.host(34, "build-1").with_binding_failure(
        BindingKind::ThreadResolver,
        BindingError::Failed("slot is read-only".to_string()),
    ));
    let loader = fixture.loader(APP_ID, host.clone(), Arc::new(RecordingProcessControl::default()));
    let outcome = loader.try_load();

    assert_eq!(outcome.status, LoadStatus::SubsystemLoadFail);
    assert_eq!(outcome.subsystem, Some(Subsystem::Code));
    assert!(host.resource_archives().is_empty());
    assert_eq!(fixture.read_ledger().old_version, "");
}

#[test]
fn platform_update_switches_to_interpreted_cache_and_records_fingerprint() {
    let fixture = Fixture::new();
    let version_dir = fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new(VERSION, VERSION).with_platform_fingerprint("build-1"));

    let host = Arc::new(fixture.host(23, "build-2"));
    let loader = fixture.loader(APP_ID, host.clone(), Arc::new(RecordingProcessControl::default()));
    let outcome = loader.try_load();

    assert_eq!(outcome.status, LoadStatus::Ok, "{:?}", outcome.error);
    assert!(outcome.system_ota);
    assert_eq!(outcome.chain_strategy, Some(StrategyKind::Custom));
    assert!(outcome.bindings.contains(&BindingKind::DefiningContext));
    assert!(version_dir.join("interpret/main.module.cache").is_file());

    let ledger = fixture.read_ledger();
    assert_eq!(ledger.oat_mode, OatMode::Interpret);
    assert_eq!(ledger.platform_fingerprint, "build-2");
}

#[test]
fn oat_mode_transition_is_committed_then_cleaned_up_on_next_start() {
    let fixture = Fixture::new();
    let version_dir = fixture.write_bundle(VERSION);
    fs::create_dir_all(version_dir.join("interpret")).expect("mkdir interpret");
    fixture.write_ledger(&PatchLedger::new(VERSION, VERSION).with_oat_mode(OatMode::Transitioning));
    let control = Arc::new(RecordingProcessControl::default());

    let first = fixture.loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone());
    assert_eq!(first.try_load().status, LoadStatus::Ok);
    let ledger = fixture.read_ledger();
    assert_eq!(ledger.oat_mode, OatMode::Default);
    assert!(ledger.remove_interpret_dir_pending);

    let second = fixture.loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control);
    assert_eq!(second.try_load().status, LoadStatus::Ok);
    second.wait_for_cleanup();
    assert!(!fixture.read_ledger().remove_interpret_dir_pending);
    assert!(!version_dir.join("interpret").exists());
}

#[test]
fn removal_marker_on_never_loaded_new_version_falls_back_to_old() {
    let fixture = Fixture::new();
    let old_dir = fixture.write_bundle("old00001");
    let new_dir = fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("old00001", VERSION).with_version_to_remove(VERSION));

    let control = Arc::new(RecordingProcessControl::default());
    let loader = fixture.loader(APP_ID, Arc::new(fixture.host(34, "build-1")), control.clone());
    let outcome = loader.try_load();
    loader.wait_for_cleanup();

    assert_eq!(outcome.status, LoadStatus::Ok, "{:?}", outcome.error);
    assert_eq!(outcome.old_version.as_deref(), Some("old00001"));
    assert!(!new_dir.exists());
    assert!(old_dir.is_dir());
    assert_eq!(control.kill_calls(), 0);
    let ledger = fixture.read_ledger();
    assert_eq!(ledger.old_version, "old00001");
    assert_eq!(ledger.new_version, "old00001");
    assert!(!ledger.has_removal_marker());
}

#[test]
fn unwritable_ledger_reports_rewrite_failure_after_activation() {
    let fixture = Fixture::new();
    fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("", VERSION));
    let before = fixture.ledger_bytes();
    // A directory squatting on the temporary file blocks the atomic write.
    fs::create_dir_all(atomic_tmp_path(&fixture.layout.ledger_file())).expect("block tmp path");

    let host = Arc::new(fixture.host(34, "build-1"));
    let control = Arc::new(RecordingProcessControl::default());
    let loader = fixture.loader(APP_ID, host.clone(), control.clone());
    let outcome = loader.try_load();

    assert_eq!(outcome.status, LoadStatus::RewriteInfoFail);
    assert_eq!(outcome.result_code, -11);
    assert_eq!(control.kill_calls(), 0);
    assert_eq!(fixture.ledger_bytes(), before);

    let chain = host.current_resolver().expect("chain stays installed");
    assert_eq!(chain.find_definition("app.Main").expect("main").payload, b"patched main");
    assert_eq!(host.resource_archives().len(), 1);
}

#[test]
fn resource_install_failure_stops_before_commit() {
    let fixture = Fixture::new();
    fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("", VERSION));
    let before = fixture.ledger_bytes();

    let host = Arc::new(fixture.host(34, "build-1").with_failing_resources());
    let control = Arc::new(RecordingProcessControl::default());
    let loader = fixture.loader(APP_ID, host.clone(), control.clone());
    let outcome = loader.try_load();

    assert_eq!(outcome.status, LoadStatus::SubsystemLoadFail);
    assert_eq!(outcome.result_code, -10);
    assert_eq!(outcome.subsystem, Some(Subsystem::Resources));
    assert!(host.resource_archives().is_empty());
    assert_eq!(control.kill_calls(), 0);
    assert_eq!(fixture.ledger_bytes(), before);
}

#[test]
fn active_alt_runtime_loads_hot_swap_modules_instead_of_code() {
    let fixture = Fixture::new();
    let version_dir = fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("", VERSION));

    let host = Arc::new(fixture.host(34, "build-1").with_alt_runtime_active(true));
    let loader = fixture.loader(APP_ID, host.clone(), Arc::new(RecordingProcessControl::default()));
    let outcome = loader.try_load();

    assert_eq!(outcome.status, LoadStatus::Ok, "{:?}", outcome.error);
    assert_eq!(outcome.loaded_modules, vec!["hotfix.module".to_string()]);
    assert_eq!(outcome.chain_strategy, None);
    assert!(host.current_resolver().is_none());
    assert_eq!(
        host.alt_runtime_modules(),
        vec![version_dir.join("alt/hotfix.module")]
    );
    assert_eq!(host.resource_archives(), vec![version_dir.join("res/main.arsc")]);
    assert_eq!(fixture.read_ledger().old_version, VERSION);
}

#[test]
fn registered_plugin_answers_first_in_custom_chain() {
    let fixture = Fixture::new();
    fixture.write_bundle(VERSION);
    fixture.write_ledger(&PatchLedger::new("", VERSION));
    let plugin_module = fixture.dir.path().join("app/plugin/ext.module");
    fs::create_dir_all(plugin_module.parent().expect("parent")).expect("mkdir plugin");
    fs::write(&plugin_module, module_json(&[("app.Main", "plugin main")])).expect("write plugin");
    let plugin = ModuleResolver::from_modules("plugin", &[plugin_module], None).expect("load plugin");

    let host = Arc::new(fixture.host(24, "build-1").with_plugin(Arc::new(plugin)));
    let loader = fixture.loader(APP_ID, host.clone(), Arc::new(RecordingProcessControl::default()));
    let outcome = loader.try_load();

    assert_eq!(outcome.status, LoadStatus::Ok, "{:?}", outcome.error);
    assert_eq!(outcome.chain_strategy, Some(StrategyKind::Custom));
    let chain = host.current_resolver().expect("chain installed");
    assert_eq!(chain.find_definition("app.Main").expect("main").origin, "plugin");
    assert_eq!(chain.find_definition("app.Feature").expect("feature").payload, b"patched feature");
}
