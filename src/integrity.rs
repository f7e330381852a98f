use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fsutil::{decode_hex_or_base64, is_legal_file, sha256_hex};
use crate::layout::signature_path;
use crate::subsystem::{Subsystem, SubsystemFlags};

pub const BUNDLE_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubBundleManifest {
    pub digest: String,
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

impl SubBundleManifest {
    pub fn from_entries(entries: Vec<ManifestEntry>) -> Self {
        let digest = sha256_hex(listing(&entries).as_bytes());
        Self { digest, entries }
    }

    pub fn computed_digest(&self) -> String {
        sha256_hex(listing(&self.entries).as_bytes())
    }
}

fn listing(entries: &[ManifestEntry]) -> String {
    entries
        .iter()
        .map(|entry| format!("{}  {}\n", entry.sha256.trim().to_ascii_lowercase(), entry.name))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemManifests {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<SubBundleManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_runtime: Option<SubBundleManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<SubBundleManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<SubBundleManifest>,
}

impl SubsystemManifests {
    pub fn get(&self, subsystem: Subsystem) -> Option<&SubBundleManifest> {
        match subsystem {
            Subsystem::Code => self.code.as_ref(),
            Subsystem::AltRuntime => self.alt_runtime.as_ref(),
            Subsystem::Native => self.native.as_ref(),
            Subsystem::Resources => self.resources.as_ref(),
        }
    }

    pub fn set(&mut self, subsystem: Subsystem, manifest: SubBundleManifest) {
        let slot = match subsystem {
            Subsystem::Code => &mut self.code,
            Subsystem::AltRuntime => &mut self.alt_runtime,
            Subsystem::Native => &mut self.native,
            Subsystem::Resources => &mut self.resources,
        };
        *slot = Some(manifest);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub format: u32,
    pub patch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_id: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub subsystems: SubsystemManifests,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    BundleFileMissing,
    SignatureMissing,
    SignatureMismatch,
    ManifestUnreadable,
    ManifestDigestMismatch(Subsystem),
    BaseIdMismatch,
    SubsystemNotSupported(Subsystem),
    SigningKeyInvalid,
}

impl CheckStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::BundleFileMissing => -1,
            Self::SignatureMissing => -2,
            Self::SignatureMismatch => -3,
            Self::ManifestUnreadable => -4,
            Self::ManifestDigestMismatch(_) => -5,
            Self::BaseIdMismatch => -6,
            Self::SubsystemNotSupported(_) => -7,
            Self::SigningKeyInvalid => -8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::BundleFileMissing => "bundle_file_missing",
            Self::SignatureMissing => "signature_missing",
            Self::SignatureMismatch => "signature_mismatch",
            Self::ManifestUnreadable => "manifest_unreadable",
            Self::ManifestDigestMismatch(_) => "manifest_digest_mismatch",
            Self::BaseIdMismatch => "base_id_mismatch",
            Self::SubsystemNotSupported(_) => "subsystem_not_supported",
            Self::SigningKeyInvalid => "signing_key_invalid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckFailure {
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckFailure {
    fn new(status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "package check failed ({}, code {}): {}",
            self.status.as_str(),
            self.status.code(),
            self.detail
        )
    }
}

#[derive(Debug, Clone)]
pub struct VerifiedPackage {
    pub manifest: BundleManifest,
    pub properties: BTreeMap<String, String>,
}

impl VerifiedPackage {
    pub fn from_manifest(manifest: BundleManifest) -> Self {
        let mut properties = manifest.properties.clone();
        properties
            .entry("patch_id".to_string())
            .or_insert_with(|| manifest.patch_id.clone());
        if let Some(base_id) = &manifest.base_id {
            properties
                .entry("base_id".to_string())
                .or_insert_with(|| base_id.clone());
        }
        Self {
            manifest,
            properties,
        }
    }
}

pub trait PackageVerifier: Send + Sync {
    fn verify(&self, version_file: &Path) -> Result<VerifiedPackage, CheckFailure>;
}

#[derive(Debug, Clone)]
pub struct Ed25519PackageVerifier {
    trusted_public_key: Option<String>,
    expected_base_id: Option<String>,
    enabled: SubsystemFlags,
}

impl Ed25519PackageVerifier {
    pub fn new(trusted_public_key: Option<String>) -> Self {
        Self {
            trusted_public_key,
            expected_base_id: None,
            enabled: SubsystemFlags::all(),
        }
    }

    pub fn with_expected_base_id(mut self, base_id: Option<String>) -> Self {
        self.expected_base_id = base_id;
        self
    }

    pub fn with_enabled_subsystems(mut self, enabled: SubsystemFlags) -> Self {
        self.enabled = enabled;
        self
    }

    fn check_signature(&self, version_file: &Path, manifest_bytes: &[u8]) -> Result<(), CheckFailure> {
        let verifying_key = self
            .trusted_public_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                CheckFailure::new(
                    CheckStatus::SigningKeyInvalid,
                    "package verification requires RUSTY_PATCH_TRUSTED_ED25519_PUBLIC_KEY",
                )
            })
            .and_then(|raw| {
                parse_ed25519_public_key(raw)
                    .map_err(|err| CheckFailure::new(CheckStatus::SigningKeyInvalid, format!("{err:#}")))
            })?;

        let sig_path = signature_path(version_file);
        if !sig_path.is_file() {
            return Err(CheckFailure::new(
                CheckStatus::SignatureMissing,
                format!("signature file does not exist: {}", sig_path.display()),
            ));
        }
        let signature_raw = fs::read(&sig_path).map_err(|err| {
            CheckFailure::new(
                CheckStatus::SignatureMissing,
                format!("failed reading signature {}: {err}", sig_path.display()),
            )
        })?;
        let signature = parse_ed25519_signature(&signature_raw)
            .map_err(|err| CheckFailure::new(CheckStatus::SignatureMismatch, format!("{err:#}")))?;

        verifying_key
            .verify(manifest_bytes, &signature)
            .map_err(|_| {
                CheckFailure::new(
                    CheckStatus::SignatureMismatch,
                    format!(
                        "Ed25519 signature verification failed for {}",
                        version_file.display()
                    ),
                )
            })
    }

    fn check_manifest(&self, manifest: &BundleManifest) -> Result<(), CheckFailure> {
        if manifest.format != BUNDLE_FORMAT {
            return Err(CheckFailure::new(
                CheckStatus::ManifestUnreadable,
                format!(
                    "unsupported bundle format {} (expected {BUNDLE_FORMAT})",
                    manifest.format
                ),
            ));
        }

        for subsystem in Subsystem::ALL {
            let Some(section) = manifest.subsystems.get(subsystem) else {
                continue;
            };
            let computed = section.computed_digest();
            if !computed.eq_ignore_ascii_case(section.digest.trim()) {
                return Err(CheckFailure::new(
                    CheckStatus::ManifestDigestMismatch(subsystem),
                    format!(
                        "{} sub-bundle digest mismatch (expected {}, got {})",
                        subsystem.as_str(),
                        section.digest,
                        computed
                    ),
                ));
            }
        }

        if let Some(expected) = self
            .expected_base_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            let actual = manifest.base_id.as_deref().map(str::trim).unwrap_or("");
            if actual != expected {
                return Err(CheckFailure::new(
                    CheckStatus::BaseIdMismatch,
                    format!("bundle base id '{actual}' does not match '{expected}'"),
                ));
            }
        }

        for subsystem in Subsystem::ALL {
            let carries_entries = manifest
                .subsystems
                .get(subsystem)
                .is_some_and(|section| !section.entries.is_empty());
            if carries_entries && !self.enabled.is_enabled(subsystem) {
                return Err(CheckFailure::new(
                    CheckStatus::SubsystemNotSupported(subsystem),
                    format!(
                        "bundle carries a {} sub-bundle but the subsystem is disabled",
                        subsystem.as_str()
                    ),
                ));
            }
        }

        Ok(())
    }
}

impl PackageVerifier for Ed25519PackageVerifier {
    fn verify(&self, version_file: &Path) -> Result<VerifiedPackage, CheckFailure> {
        if !is_legal_file(version_file) {
            return Err(CheckFailure::new(
                CheckStatus::BundleFileMissing,
                format!("bundle file does not exist: {}", version_file.display()),
            ));
        }
        let manifest_bytes = fs::read(version_file).map_err(|err| {
            CheckFailure::new(
                CheckStatus::BundleFileMissing,
                format!("failed reading bundle {}: {err}", version_file.display()),
            )
        })?;

        self.check_signature(version_file, &manifest_bytes)?;

        let manifest: BundleManifest = serde_json::from_slice(&manifest_bytes).map_err(|err| {
            CheckFailure::new(
                CheckStatus::ManifestUnreadable,
                format!("failed parsing bundle manifest {}: {err}", version_file.display()),
            )
        })?;
        if let Err(failure) = self.check_manifest(&manifest) {
            warn!(
                bundle = %version_file.display(),
                status = failure.status.as_str(),
                "bundle manifest rejected"
            );
            return Err(failure);
        }

        debug!(
            bundle = %version_file.display(),
            patch_id = %manifest.patch_id,
            "bundle manifest verified"
        );
        Ok(VerifiedPackage::from_manifest(manifest))
    }
}

pub fn parse_ed25519_public_key(raw: &str) -> Result<VerifyingKey> {
    let bytes = decode_hex_or_base64(raw)?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("Ed25519 public key must decode to 32 bytes"))?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|_| anyhow!("invalid Ed25519 public key bytes"))
}

fn parse_ed25519_signature(raw: &[u8]) -> Result<Signature> {
    if raw.len() == 64 {
        let signature_bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| anyhow!("invalid Ed25519 signature bytes"))?;
        return Ok(Signature::from_bytes(&signature_bytes));
    }

    let text = std::str::from_utf8(raw)
        .context("bundle signature must be UTF-8 text or 64-byte raw signature")?
        .trim();
    if text.is_empty() {
        return Err(anyhow!("bundle signature file is empty"));
    }

    let decoded = decode_hex_or_base64(text)?;
    let signature_bytes: [u8; 64] = decoded
        .try_into()
        .map_err(|_| anyhow!("Ed25519 signature must decode to 64 bytes"))?;
    Ok(Signature::from_bytes(&signature_bytes))
}
