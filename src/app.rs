use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tracing::warn;

use crate::config::{DoctorReport, Settings};
use crate::host::{HostRuntime, StandaloneHost};
use crate::integrity::{Ed25519PackageVerifier, PackageVerifier};
use crate::ledger::{LedgerError, PatchLedger};
use crate::loader::{LoadOutcome, PatchLoader};
use crate::report::{JsonOutcomeSink, OutcomeSink};
use crate::resolver::{LookupError, ResolutionSource};

pub struct PatchApp {
    settings: Settings,
    host: Arc<StandaloneHost>,
    loader: PatchLoader,
    sink: JsonOutcomeSink,
}

impl PatchApp {
    pub fn new(settings: Settings) -> Result<Self> {
        let host = StandaloneHost::open(
            &settings.app_dir,
            settings.host.capability_level,
            settings.host.platform_fingerprint.clone(),
        )
        .with_context(|| {
            format!(
                "failed opening application directory {}",
                settings.app_dir.display()
            )
        })?
        .with_alt_runtime_active(settings.host.alt_runtime_active);
        let host = Arc::new(host);
        let loader = PatchLoader::from_settings(&settings, host.clone());
        let sink = JsonOutcomeSink::new(&settings.outcome_dir);
        Ok(Self {
            settings,
            host,
            loader,
            sink,
        })
    }

    pub fn doctor(&self) -> DoctorReport {
        self.settings.doctor_report()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn load(&self) -> LoadOutcome {
        let outcome = self.loader.try_load();
        if let Err(err) = self.sink.publish(&outcome) {
            warn!(error = %format!("{err:#}"), "failed publishing load outcome");
        }
        self.loader.wait_for_cleanup();
        outcome
    }

    pub fn load_json(&self) -> Result<String> {
        let outcome = self.load();
        serde_json::to_string_pretty(&json!({
            "status": outcome.status.as_str(),
            "outcome": outcome
        }))
        .context("failed to encode load result")
    }

    pub fn ledger_json(&self) -> Result<String> {
        let store = self.loader.ledger();
        let payload = match store.read() {
            Ok(ledger) => json!({
                "status": "ok",
                "path": store.path().display().to_string(),
                "ledger": ledger_value(&ledger)
            }),
            Err(LedgerError::NotFound(path)) => json!({
                "status": "missing",
                "path": path.display().to_string()
            }),
            Err(err) => json!({
                "status": "corrupted",
                "path": store.path().display().to_string(),
                "error": format!("{err:#}")
            }),
        };
        serde_json::to_string_pretty(&payload).context("failed to encode ledger result")
    }

    pub fn verify_json(&self, version: Option<&str>) -> Result<String> {
        let version = match version.map(str::trim).filter(|value| !value.is_empty()) {
            Some(version) => version.to_string(),
            None => self
                .loader
                .ledger()
                .read()
                .map_err(|err| anyhow!("{err:#}"))
                .context("no version given and the ledger could not be read")?
                .new_version,
        };
        let version_file = self
            .loader
            .layout()
            .version_file(&version)
            .ok_or_else(|| anyhow!("'{version}' is not a valid patch version"))?;

        let verifier = Ed25519PackageVerifier::new(self.settings.patch.trusted_ed25519_public_key.clone())
            .with_expected_base_id(self.settings.patch.base_id.clone())
            .with_enabled_subsystems(self.settings.patch.subsystems);
        let payload = match verifier.verify(&version_file) {
            Ok(package) => json!({
                "status": "ok",
                "version": version,
                "version_file": version_file.display().to_string(),
                "check_code": 0,
                "properties": package.properties,
                "manifest": package.manifest
            }),
            Err(failure) => json!({
                "status": failure.status.as_str(),
                "version": version,
                "version_file": version_file.display().to_string(),
                "check_code": failure.status.code(),
                "error": failure.detail
            }),
        };
        serde_json::to_string_pretty(&payload).context("failed to encode verify result")
    }

    pub fn safe_mode_status_json(&self) -> Result<String> {
        let report = self.loader.safe_mode().status(&self.settings.process_name);
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "report": report
        }))
        .context("failed to encode safe-mode status result")
    }

    pub fn safe_mode_reset_json(&self, confirm: bool) -> Result<String> {
        if !confirm {
            return Err(anyhow!(
                "safe-mode reset requires explicit confirmation. Re-run with --confirm"
            ));
        }
        let report = self
            .loader
            .safe_mode()
            .acknowledge_success(&self.settings.process_name)?;
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "report": report
        }))
        .context("failed to encode safe-mode reset result")
    }

    pub fn resolve_json(&self, name: &str) -> Result<String> {
        let outcome = self.load();
        let resolver: Arc<dyn ResolutionSource> = self
            .host
            .current_resolver()
            .unwrap_or_else(|| self.host.original_resolver());
        let payload = match resolver.find_definition(name) {
            Ok(definition) => json!({
                "status": "ok",
                "load_status": outcome.status.as_str(),
                "resolver": resolver.label(),
                "name": definition.name,
                "origin": definition.origin,
                "payload": String::from_utf8_lossy(&definition.payload)
            }),
            Err(LookupError::NotFound(name)) => json!({
                "status": "not_found",
                "load_status": outcome.status.as_str(),
                "resolver": resolver.label(),
                "name": name
            }),
        };
        serde_json::to_string_pretty(&payload).context("failed to encode resolve result")
    }

    pub fn report_json(&self) -> Result<String> {
        let snapshot = self.sink.snapshot()?;
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "report": snapshot
        }))
        .context("failed to encode outcome report")
    }
}

fn ledger_value(ledger: &PatchLedger) -> serde_json::Value {
    json!({
        "old_version": ledger.old_version,
        "new_version": ledger.new_version,
        "version_to_remove": ledger.version_to_remove,
        "oat_mode": ledger.oat_mode,
        "protected_app": ledger.protected_app,
        "use_custom_patch": ledger.use_custom_patch,
        "platform_fingerprint": ledger.platform_fingerprint,
        "remove_interpret_dir_pending": ledger.remove_interpret_dir_pending
    })
}
