//! Named volumes on the node.
//!
//! A volume is a directory under `{data_dir}/volumes/{name}/_data`, created on
//! first use and kept until removed explicitly.

use std::io;
use std::path::PathBuf;

use convoy_agent_api::VolumeHandle;
use convoy_id::NodeId;
use thiserror::Error;
use tracing::info;

const MAX_VOLUME_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("invalid volume name '{0}'")]
    InvalidName(String),

    #[error("volume I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct VolumeStore {
    root: PathBuf,
    node_id: NodeId,
}

impl VolumeStore {
    pub fn new(root: impl Into<PathBuf>, node_id: NodeId) -> Self {
        Self {
            root: root.into(),
            node_id,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name).join("_data")
    }

    /// Create the volume if it does not exist yet.
    pub fn ensure(&self, name: &str) -> Result<VolumeHandle, VolumeError> {
        validate_name(name)?;
        let path = self.path(name);
        let created = !path.is_dir();
        if created {
            std::fs::create_dir_all(&path)?;
            info!(volume = %name, path = %path.display(), "Volume created");
        }

        Ok(VolumeHandle {
            name: name.to_string(),
            node_id: self.node_id,
            mountpoint: path.to_string_lossy().into_owned(),
            created,
        })
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.path(name).is_dir()
    }

    /// Names of all volumes, sorted.
    pub fn list(&self) -> Result<Vec<String>, VolumeError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn remove(&self, name: &str) -> Result<(), VolumeError> {
        validate_name(name)?;
        match std::fs::remove_dir_all(self.root.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_name(name: &str) -> Result<(), VolumeError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_VOLUME_NAME_LEN
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(VolumeError::InvalidName(name.to_string()))
    }
}
