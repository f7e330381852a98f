use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub fn compute_sha256_hex(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed opening file {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed reading file {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn normalize_sha256_hex(raw: &str) -> Result<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.len() != 64 {
        return Err(anyhow!("checksum must be a 64-character SHA-256 hex string"));
    }
    if !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(anyhow!("checksum must contain only hex characters"));
    }
    Ok(normalized)
}

pub fn is_legal_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

pub fn atomic_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("tmp");
    path.with_file_name(format!("{file_name}.{}.tmp", std::process::id()))
}

pub fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating dir {}", parent.display()))?;
    }
    let tmp = atomic_tmp_path(path);
    fs::write(&tmp, payload).with_context(|| format!("failed writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed replacing {} -> {}",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Fire-and-forget recursive delete. Failures are logged, never surfaced.
pub fn delete_dir_async(path: PathBuf) -> Option<thread::JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("rusty-patch-delete".to_string())
        .spawn(move || match fs::remove_dir_all(&path) {
            Ok(()) => debug!(dir = %path.display(), "stale patch directory deleted"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                dir = %path.display(),
                error = %err,
                "failed deleting stale patch directory"
            ),
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "failed spawning delete thread");
            None
        }
    }
}

pub fn decode_hex_or_base64(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("value is empty"));
    }
    if trimmed.len() % 2 == 0 && trimmed.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return decode_hex_string(trimmed);
    }

    general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|_| anyhow!("value must be base64 or hex encoded"))
}

fn decode_hex_string(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(anyhow!("hex value length must be even"));
    }

    let mut out = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| anyhow!("value must contain valid hexadecimal characters"))?;
        out.push(byte);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{
        compute_sha256_hex, decode_hex_or_base64, delete_dir_async, is_legal_file,
        normalize_sha256_hex, sha256_hex, write_atomic,
    };

    #[test]
    fn file_and_buffer_hashes_agree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"patched bytes").expect("write");

        let from_file = compute_sha256_hex(&path).expect("hash");
        assert_eq!(from_file, sha256_hex(b"patched bytes"));
        assert_eq!(normalize_sha256_hex(&from_file.to_uppercase()).expect("norm"), from_file);
    }

    #[test]
    fn legal_file_rejects_empty_and_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").expect("write");
        assert!(!is_legal_file(&empty));
        assert!(!is_legal_file(dir.path()));
        assert!(!is_legal_file(&dir.path().join("missing")));

        write_atomic(&dir.path().join("nested/ok"), b"x").expect("atomic write");
        assert!(is_legal_file(&dir.path().join("nested/ok")));
    }

    #[test]
    fn hex_and_base64_decode_to_same_bytes() {
        assert_eq!(decode_hex_or_base64("0aff").expect("hex"), vec![0x0a, 0xff]);
        assert_eq!(decode_hex_or_base64("Cv8=").expect("b64"), vec![0x0a, 0xff]);
        assert!(decode_hex_or_base64("  ").is_err());
    }

    #[test]
    fn async_delete_removes_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let victim = dir.path().join("patch-deadbeef");
        std::fs::create_dir_all(victim.join("code")).expect("mkdir");
        std::fs::write(victim.join("code/a.module"), b"{}").expect("write");

        let handle = delete_dir_async(victim.clone()).expect("spawned");
        handle.join().expect("join");
        assert!(!victim.exists());
    }
}
