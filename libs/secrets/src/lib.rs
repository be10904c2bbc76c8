//! Secret payloads and their materialization into task containers.
//!
//! A secret reaches a container as one file per reference, written into the
//! container's secrets directory (mounted at `/run/secrets`). The file name,
//! owner and mode come from the service's secret reference; the bytes come
//! from the secret store and are handed over as a [`SecretPayload`], whose
//! `Debug` output never shows the plaintext.
//!
//! Files are written atomically (temp file + fsync + rename) with the mode
//! applied at creation, so a partially written secret is never visible.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Container path under which secret files appear.
pub const SECRETS_MOUNT_PATH: &str = "/run/secrets";

/// Maximum payload size accepted for a secret.
pub const MAX_PAYLOAD_BYTES: usize = 500 * 1024;

/// Owner used when a reference does not name one.
pub const DEFAULT_UID: &str = "0";

/// Group used when a reference does not name one.
pub const DEFAULT_GID: &str = "0";

/// Mode used when a reference does not name one (owner read-only).
pub const DEFAULT_MODE: u32 = 0o400;

/// Secret handling errors.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// Target file name is not a plain file name.
    #[error("invalid secret file name '{name}': {reason}")]
    InvalidFileName { name: String, reason: String },

    /// UID or GID is not a decimal id.
    #[error("invalid {field} '{value}': must be a decimal id")]
    InvalidOwner { field: &'static str, value: String },

    /// Mode has bits outside the permission range.
    #[error("invalid file mode {mode:#o}")]
    InvalidMode { mode: u32 },

    /// Payload is larger than [`MAX_PAYLOAD_BYTES`].
    #[error("secret payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}")]
    PayloadTooLarge { size: usize },

    /// Changing the owner of the written file failed.
    #[error("chown {path} failed: {source}")]
    Chown {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Secret plaintext.
///
/// Only the component resolving bindings right before dispatch and the node
/// agent writing the file ever hold one of these.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretPayload(Vec<u8>);

impl SecretPayload {
    /// Wrap plaintext bytes, enforcing the size limit.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, SecretsError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(SecretsError::PayloadTooLarge { size: bytes.len() });
        }
        Ok(Self(bytes))
    }

    /// Borrow the plaintext.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SHA-256 of the plaintext, safe to log and compare.
    pub fn digest(&self) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(&self.0)))
    }
}

impl std::fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretPayload([REDACTED; {} bytes])", self.0.len())
    }
}

impl Drop for SecretPayload {
    fn drop(&mut self) {
        // Best effort: overwrite before the allocation is released.
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Where and how a secret lands inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretFileTarget {
    /// File name under [`SECRETS_MOUNT_PATH`].
    pub name: String,

    /// Owning user id, as a decimal string.
    pub uid: String,

    /// Owning group id, as a decimal string.
    pub gid: String,

    /// Permission bits.
    pub mode: u32,
}

impl SecretFileTarget {
    /// Build a target, filling defaults for anything not given.
    pub fn with_defaults(
        secret_name: &str,
        name: Option<String>,
        uid: Option<String>,
        gid: Option<String>,
        mode: Option<u32>,
    ) -> Self {
        Self {
            name: name.unwrap_or_else(|| secret_name.to_string()),
            uid: uid.unwrap_or_else(|| DEFAULT_UID.to_string()),
            gid: gid.unwrap_or_else(|| DEFAULT_GID.to_string()),
            mode: mode.unwrap_or(DEFAULT_MODE),
        }
    }

    /// Check file name, owner ids and mode.
    pub fn validate(&self) -> Result<(), SecretsError> {
        validate_file_name(&self.name)?;
        parse_id("uid", &self.uid)?;
        parse_id("gid", &self.gid)?;
        if self.mode & !0o7777 != 0 {
            return Err(SecretsError::InvalidMode { mode: self.mode });
        }
        Ok(())
    }

    /// Numeric uid.
    pub fn uid_value(&self) -> Result<u32, SecretsError> {
        parse_id("uid", &self.uid)
    }

    /// Numeric gid.
    pub fn gid_value(&self) -> Result<u32, SecretsError> {
        parse_id("gid", &self.gid)
    }

    /// Path of this file inside the container.
    pub fn container_path(&self) -> String {
        format!("{SECRETS_MOUNT_PATH}/{}", self.name)
    }
}

/// Validate a secret file name: a single, non-special path component.
pub fn validate_file_name(name: &str) -> Result<(), SecretsError> {
    let reason = if name.is_empty() {
        Some("name cannot be empty")
    } else if name == "." || name == ".." {
        Some("name cannot be a relative path component")
    } else if name.contains('/') {
        Some("name cannot contain '/'")
    } else if name.contains('\0') {
        Some("name cannot contain NUL")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(SecretsError::InvalidFileName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn parse_id(field: &'static str, value: &str) -> Result<u32, SecretsError> {
    value.parse::<u32>().map_err(|_| SecretsError::InvalidOwner {
        field,
        value: value.to_string(),
    })
}

/// Whether materialization changes file ownership.
///
/// Applying ownership needs privileges; unprivileged agents (and tests) keep
/// the writing user as owner and only record the requested ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    /// `chown` the file to the requested uid/gid.
    Apply,
    /// Leave ownership as created.
    #[default]
    Skip,
}

/// Write one secret file into `dir` atomically.
///
/// Returns the host path of the written file.
pub fn write_secret_file(
    dir: &Path,
    target: &SecretFileTarget,
    payload: &SecretPayload,
    ownership: Ownership,
) -> Result<PathBuf, SecretsError> {
    target.validate()?;
    fs::create_dir_all(dir)?;

    let path = dir.join(&target.name);
    let temp_path = dir.join(format!(".{}.tmp", target.name));

    // A leftover temp file is read-only and would fail the open below.
    match fs::remove_file(&temp_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(target.mode)
            .open(&temp_path)?;

        file.write_all(payload.expose())?;
        file.sync_all()?;
    }

    // The umask may have stripped bits from the creation mode.
    fs::set_permissions(&temp_path, fs::Permissions::from_mode(target.mode))?;

    if ownership == Ownership::Apply {
        let uid = nix::unistd::Uid::from_raw(target.uid_value()?);
        let gid = nix::unistd::Gid::from_raw(target.gid_value()?);
        nix::unistd::chown(&temp_path, Some(uid), Some(gid)).map_err(|source| {
            SecretsError::Chown {
                path: temp_path.clone(),
                source,
            }
        })?;
    }

    fs::rename(&temp_path, &path)?;
    Ok(path)
}

/// Remove a directory of materialized secrets.
pub fn remove_secret_dir(dir: &Path) -> Result<(), SecretsError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_secret_name() {
        let target = SecretFileTarget::with_defaults("test_secret", None, None, None, None);
        assert_eq!(target.name, "test_secret");
        assert_eq!(target.uid, "0");
        assert_eq!(target.gid, "0");
        assert_eq!(target.mode, 0o400);
        assert_eq!(target.container_path(), "/run/secrets/test_secret");
    }

    #[test]
    fn test_target_override() {
        let target = SecretFileTarget::with_defaults(
            "test_secret",
            Some("testing".to_string()),
            Some("1000".to_string()),
            None,
            Some(0o440),
        );
        assert_eq!(target.name, "testing");
        assert_eq!(target.uid, "1000");
        assert_eq!(target.gid, "0");
        assert!(target.validate().is_ok());
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("db_password").is_ok());
        assert!(validate_file_name("cert.pem").is_ok());

        assert!(validate_file_name("").is_err());
        assert!(validate_file_name(".").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name("a/b").is_err());
    }

    #[test]
    fn test_owner_and_mode_validation() {
        let mut target = SecretFileTarget::with_defaults("s", None, None, None, None);
        target.uid = "root".to_string();
        assert!(matches!(
            target.validate(),
            Err(SecretsError::InvalidOwner { field: "uid", .. })
        ));

        let mut target = SecretFileTarget::with_defaults("s", None, None, None, None);
        target.mode = 0o10000;
        assert!(matches!(
            target.validate(),
            Err(SecretsError::InvalidMode { .. })
        ));
    }

    #[test]
    fn test_payload_is_redacted_in_debug() {
        let payload = SecretPayload::new(b"TESTINGDATA".to_vec()).unwrap();
        let rendered = format!("{payload:?}");
        assert!(!rendered.contains("TESTINGDATA"));
        assert!(rendered.contains("11 bytes"));
        assert!(payload.digest().starts_with("sha256:"));
    }

    #[test]
    fn test_payload_size_limit() {
        let big = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert!(matches!(
            SecretPayload::new(big),
            Err(SecretsError::PayloadTooLarge { .. })
        ));
        assert!(SecretPayload::new(vec![0u8; MAX_PAYLOAD_BYTES]).is_ok());
    }

    #[test]
    fn test_write_secret_file() {
        let dir = tempfile::tempdir().unwrap();
        let secrets_dir = dir.path().join("secrets");
        let target = SecretFileTarget::with_defaults(
            "test_secret",
            Some("testing".to_string()),
            None,
            None,
            None,
        );
        let payload = SecretPayload::new(b"TESTINGDATA".to_vec()).unwrap();

        let path = write_secret_file(&secrets_dir, &target, &payload, Ownership::Skip).unwrap();

        assert_eq!(path, secrets_dir.join("testing"));
        assert_eq!(fs::read(&path).unwrap(), b"TESTINGDATA");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
        assert!(!secrets_dir.join(".testing.tmp").exists());

        remove_secret_dir(&secrets_dir).unwrap();
        assert!(!secrets_dir.exists());
        remove_secret_dir(&secrets_dir).unwrap();
    }

    #[test]
    fn test_target_json_shape() {
        let target = SecretFileTarget::with_defaults("test_secret", None, None, None, None);
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["name"], "test_secret");
        assert_eq!(json["uid"], "0");
        assert_eq!(json["gid"], "0");
        assert_eq!(json["mode"], 256);
    }
}
