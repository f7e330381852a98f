use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::integrity::parse_ed25519_public_key;
use crate::resolver::LookupOrder;
use crate::safe_mode::DEFAULT_SAFE_MODE_MAX_COUNT;
use crate::subsystem::SubsystemFlags;

const ENV_FILE_ENV: &str = "RUSTY_PATCH_ENV_FILE";
const DEFAULT_CAPABILITY_LEVEL: u32 = 34;
const OS_RELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub patch_root: PathBuf,
    pub outcome_dir: PathBuf,
    pub app_dir: PathBuf,
    pub app_id: String,
    pub process_name: String,
    pub patch: PatchSettings,
    pub host: HostSettings,
}

#[derive(Debug, Clone)]
pub struct PatchSettings {
    pub enabled: bool,
    pub subsystems: SubsystemFlags,
    pub safe_mode_max_count: u32,
    pub trusted_ed25519_public_key: Option<String>,
    pub base_id: Option<String>,
    pub lookup_order: LookupOrder,
    pub lookup_order_raw: Option<String>,
    pub use_delegate_last: bool,
    pub kill_siblings: bool,
}

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub capability_level: u32,
    pub platform_fingerprint: String,
    pub alt_runtime_active: bool,
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let data_dir = read_path_env("RUSTY_PATCH_DATA_DIR").unwrap_or_else(|| PathBuf::from("./data"));
        let patch_root = read_path_env("RUSTY_PATCH_ROOT").unwrap_or_else(|| data_dir.join("patch"));
        let outcome_dir =
            read_path_env("RUSTY_PATCH_OUTCOME_DIR").unwrap_or_else(|| data_dir.join("outcome"));
        let app_dir = read_path_env("RUSTY_PATCH_APP_DIR").unwrap_or_else(|| data_dir.join("app"));

        let app_id = read_non_empty_env("RUSTY_PATCH_APP_ID").unwrap_or_else(|| "app".to_string());
        let process_name =
            read_non_empty_env("RUSTY_PATCH_PROCESS_NAME").unwrap_or_else(|| app_id.clone());

        let lookup_order_raw = read_non_empty_env("RUSTY_PATCH_LOOKUP_ORDER");
        let lookup_order = lookup_order_raw
            .as_deref()
            .and_then(LookupOrder::parse)
            .unwrap_or_default();

        let patch = PatchSettings {
            enabled: read_bool_env("RUSTY_PATCH_ENABLED", true),
            subsystems: SubsystemFlags {
                code: read_bool_env("RUSTY_PATCH_ENABLE_CODE", true),
                alt_runtime: read_bool_env("RUSTY_PATCH_ENABLE_ALT_RUNTIME", true),
                native: read_bool_env("RUSTY_PATCH_ENABLE_NATIVE", true),
                resources: read_bool_env("RUSTY_PATCH_ENABLE_RESOURCES", true),
            },
            safe_mode_max_count: read_u32_env(
                "RUSTY_PATCH_SAFE_MODE_MAX_COUNT",
                DEFAULT_SAFE_MODE_MAX_COUNT,
            ),
            trusted_ed25519_public_key: read_non_empty_env(
                "RUSTY_PATCH_TRUSTED_ED25519_PUBLIC_KEY",
            ),
            base_id: read_non_empty_env("RUSTY_PATCH_BASE_ID"),
            lookup_order,
            lookup_order_raw,
            use_delegate_last: read_bool_env("RUSTY_PATCH_USE_DELEGATE_LAST", true),
            kill_siblings: read_bool_env("RUSTY_PATCH_KILL_SIBLINGS", true),
        };

        let host = HostSettings {
            capability_level: read_u32_env("RUSTY_PATCH_CAPABILITY_LEVEL", DEFAULT_CAPABILITY_LEVEL),
            platform_fingerprint: read_non_empty_env("RUSTY_PATCH_PLATFORM_FINGERPRINT")
                .unwrap_or_else(default_platform_fingerprint),
            alt_runtime_active: read_bool_env("RUSTY_PATCH_ALT_RUNTIME_ACTIVE", false),
        };

        Ok(Self {
            data_dir,
            patch_root,
            outcome_dir,
            app_dir,
            app_id,
            process_name,
            patch,
            host,
        })
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();
        let key_valid = match self.patch.trusted_ed25519_public_key.as_deref() {
            None => {
                warnings.push(
                    "RUSTY_PATCH_TRUSTED_ED25519_PUBLIC_KEY is missing; every bundle will fail package verification"
                        .to_string(),
                );
                false
            }
            Some(raw) => match parse_ed25519_public_key(raw) {
                Ok(_) => true,
                Err(err) => {
                    warnings.push(format!(
                        "RUSTY_PATCH_TRUSTED_ED25519_PUBLIC_KEY is not a valid Ed25519 key: {err:#}"
                    ));
                    false
                }
            },
        };
        if self.patch.safe_mode_max_count == 0 {
            warnings.push(
                "RUSTY_PATCH_SAFE_MODE_MAX_COUNT is 0; safe mode trips on every attempt".to_string(),
            );
        }
        if let Some(raw) = self.patch.lookup_order_raw.as_deref() {
            if LookupOrder::parse(raw).is_none() {
                warnings.push(format!(
                    "RUSTY_PATCH_LOOKUP_ORDER '{raw}' is unknown; using {}",
                    self.patch.lookup_order.as_str()
                ));
            }
        }
        if !self.patch.enabled {
            warnings.push("RUSTY_PATCH_ENABLED=false; patches will not be loaded".to_string());
        }
        if self.process_name != self.app_id
            && !self.process_name.starts_with(&format!("{}:", self.app_id))
        {
            warnings.push(format!(
                "RUSTY_PATCH_PROCESS_NAME '{}' does not belong to app '{}'",
                self.process_name, self.app_id
            ));
        }

        DoctorReport {
            data_dir: self.data_dir.clone(),
            patch_root: self.patch_root.clone(),
            outcome_dir: self.outcome_dir.clone(),
            app_dir: self.app_dir.clone(),
            app_id: self.app_id.clone(),
            process_name: self.process_name.clone(),
            enabled: self.patch.enabled,
            subsystems: self.patch.subsystems,
            safe_mode_max_count: self.patch.safe_mode_max_count,
            trusted_key_loaded: self.patch.trusted_ed25519_public_key.is_some(),
            trusted_key_valid: key_valid,
            base_id: self.patch.base_id.clone(),
            lookup_order: self.patch.lookup_order,
            use_delegate_last: self.patch.use_delegate_last,
            kill_siblings: self.patch.kill_siblings,
            capability_level: self.host.capability_level,
            platform_fingerprint: self.host.platform_fingerprint.clone(),
            alt_runtime_active: self.host.alt_runtime_active,
            warnings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub data_dir: PathBuf,
    pub patch_root: PathBuf,
    pub outcome_dir: PathBuf,
    pub app_dir: PathBuf,
    pub app_id: String,
    pub process_name: String,
    pub enabled: bool,
    pub subsystems: SubsystemFlags,
    pub safe_mode_max_count: u32,
    pub trusted_key_loaded: bool,
    pub trusted_key_valid: bool,
    pub base_id: Option<String>,
    pub lookup_order: LookupOrder,
    pub use_delegate_last: bool,
    pub kill_siblings: bool,
    pub capability_level: u32,
    pub platform_fingerprint: String,
    pub alt_runtime_active: bool,
    pub warnings: Vec<String>,
}

fn default_platform_fingerprint() -> String {
    fs::read_to_string(OS_RELEASE_PATH)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| format!("{}-{}", env::consts::OS, env::consts::ARCH))
}

fn read_path_env(key: &str) -> Option<PathBuf> {
    read_non_empty_env(key).map(PathBuf::from)
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_u32_env(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
