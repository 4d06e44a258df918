//! Config lockfile.
//!
//! One Takopi process per bot credential: the lock path is derived from the
//! config path and a fingerprint of the bot token, so two processes pointed
//! at the same credential collide even with different config files.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use sha2::{Digest, Sha256};

use crate::error::{Result, TakopiError};

/// Short stable fingerprint of a bot token, safe to embed in filenames.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

/// Held for the lifetime of the process; the advisory lock releases when the
/// file handle drops.
#[derive(Debug)]
pub struct LockHandle {
    _file: std::fs::File,
    path: PathBuf,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn lock_path(config_path: &Path, fingerprint: Option<&str>) -> PathBuf {
    let stem = match fingerprint {
        Some(fp) => format!(".takopi-{fp}.lock"),
        None => ".takopi.lock".to_string(),
    };
    config_path.with_file_name(stem)
}

pub fn acquire_lock(config_path: &Path, fingerprint: Option<&str>) -> Result<LockHandle> {
    let path = lock_path(config_path, fingerprint);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Don't truncate before holding the lock; the file may carry the pid of
    // a running process.
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    let locked = file.try_lock_exclusive()?;
    if !locked {
        let holder = std::fs::read_to_string(&path).unwrap_or_default();
        let holder = holder.trim();
        let detail = if holder.is_empty() {
            String::new()
        } else {
            format!(" (pid {holder})")
        };
        return Err(TakopiError::Config(format!(
            "another takopi process is already running for this bot{detail}.\n\
             stop it or remove {} if it is stale.",
            path.display()
        )));
    }
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(LockHandle { _file: file, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = token_fingerprint("123:abc");
        let b = token_fingerprint("123:abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, token_fingerprint("123:def"));
    }

    #[test]
    fn second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("takopi.toml");
        let _held = acquire_lock(&config, Some("deadbeef")).unwrap();
        let err = acquire_lock(&config, Some("deadbeef")).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn distinct_fingerprints_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("takopi.toml");
        let _a = acquire_lock(&config, Some("aaaa")).unwrap();
        let _b = acquire_lock(&config, Some("bbbb")).unwrap();
    }

    #[test]
    fn lock_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("takopi.toml");
        drop(acquire_lock(&config, None).unwrap());
        let _again = acquire_lock(&config, None).unwrap();
    }
}
