//! Persisted capture and detection images.
//!
//! `POST /capture` writes the captured frame, `GET /headcount` reads it back
//! and writes the detection service's annotated image. Writes go through a
//! temp file in the same directory and a rename, so readers see either the
//! previous file or the complete new one.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::StorageSettings;
use crate::error::HeadcountError;

#[derive(Clone, Debug)]
pub struct FrameStore {
    capture_path: PathBuf,
    detected_path: PathBuf,
}

impl FrameStore {
    pub fn new(settings: &StorageSettings) -> Self {
        Self {
            capture_path: settings.capture_path.clone(),
            detected_path: settings.detected_path.clone(),
        }
    }

    pub fn save_capture(&self, jpeg: &[u8]) -> Result<&Path, HeadcountError> {
        write_atomic(&self.capture_path, jpeg).map_err(HeadcountError::storage)?;
        Ok(&self.capture_path)
    }

    pub fn load_capture(&self) -> Result<Vec<u8>, HeadcountError> {
        match std::fs::read(&self.capture_path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(HeadcountError::NoCapturedImage(self.capture_path.clone()))
            }
            Err(err) => Err(HeadcountError::Storage(format!(
                "failed to read {}: {}",
                self.capture_path.display(),
                err
            ))),
        }
    }

    pub fn save_detected(&self, image: &[u8]) -> Result<&Path, HeadcountError> {
        write_atomic(&self.detected_path, image).map_err(HeadcountError::storage)?;
        Ok(&self.detected_path)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if path.file_name().is_none() {
        return Err(anyhow!("{} is not a file path", path.display()));
    }
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    // Each write gets its own temp file; concurrent saves race only on the rename.
    let mut tmp = tempfile::Builder::new()
        .prefix(".headcount-")
        .suffix(".tmp")
        .tempfile_in(&dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("failed to write {}", tmp.path().display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move image into {}", path.display()))?;
    Ok(())
}
