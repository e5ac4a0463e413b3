//! Uploaded files as seen by handlers.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use mego_protocol::{RawFile, Status};
use serde_json::Value;
use tracing::debug;

use crate::error::{HandlerError, HandlerResult};

/// A received file stored on the local disk.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    /// Original file name without its extension.
    pub name: String,
    /// Extension without the leading dot.
    pub extension: String,
    /// Where the content lives now.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Free-form values attached by handlers or chunk processors.
    pub metadata: HashMap<String, Value>,
}

impl File {
    /// Describes a file already written at `path`.
    ///
    /// Fails with `Status::Invalid` when `original_name` has no extension.
    pub fn new(original_name: &str, path: PathBuf, size: u64) -> Result<Self, HandlerError> {
        let (name, extension) = split_name(original_name).ok_or_else(|| {
            HandlerError::new(
                Status::Invalid,
                format!("file name {original_name:?} has no extension"),
            )
        })?;
        Ok(Self {
            name,
            extension,
            path,
            size,
            metadata: HashMap::new(),
        })
    }

    /// Original name with its extension.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.extension)
    }

    /// Deletes the stored content.
    pub fn remove(&self) -> HandlerResult {
        fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Moves the content into `dir`, keeping its current file name.
    pub fn move_to(&mut self, dir: impl AsRef<Path>) -> HandlerResult {
        let file_name = self
            .path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(self.file_name()));
        let target = dir.as_ref().join(file_name);
        self.relocate(target)
    }

    /// Renames the stored content within its directory.
    pub fn rename(&mut self, file_name: &str) -> HandlerResult {
        let target = match self.path.parent() {
            Some(parent) => parent.join(file_name),
            None => PathBuf::from(file_name),
        };
        self.relocate(target)
    }

    fn relocate(&mut self, target: PathBuf) -> HandlerResult {
        // rename(2) cannot cross filesystems, fall back to copy + remove.
        if fs::rename(&self.path, &target).is_err() {
            fs::copy(&self.path, &target)?;
            fs::remove_file(&self.path)?;
        }
        debug!(from = %self.path.display(), to = %target.display(), "Moved upload");
        self.path = target;
        Ok(())
    }
}

/// Splits `photo.tar.gz` into `("photo.tar", "gz")`.
///
/// Returns `None` when there is no extension or it is empty.
pub fn split_name(original: &str) -> Option<(String, String)> {
    let (stem, ext) = original.rsplit_once('.')?;
    if ext.is_empty() || ext.contains(['/', '\\']) {
        return None;
    }
    Some((stem.to_string(), ext.to_string()))
}

/// Writes a whole file into `dir` and describes it.
pub(crate) fn persist_whole(
    raw: &RawFile,
    dir: &Path,
    max_file_size: usize,
) -> Result<File, HandlerError> {
    if raw.binary.len() > max_file_size {
        return Err(HandlerError::new(
            Status::FileTooLarge,
            format!(
                "file {:?} is {} bytes (max: {max_file_size})",
                raw.name,
                raw.binary.len()
            ),
        ));
    }

    // Validate the name before touching the disk.
    let (_, extension) = split_name(&raw.name).ok_or_else(|| {
        HandlerError::new(
            Status::Invalid,
            format!("file name {:?} has no extension", raw.name),
        )
    })?;

    let mut temp = tempfile::Builder::new()
        .prefix("mego-")
        .suffix(&format!(".{extension}"))
        .tempfile_in(dir)?;
    temp.write_all(&raw.binary)?;
    let (_, path) = temp.keep().map_err(|e| HandlerError::Io(e.error))?;

    File::new(&raw.name, path, raw.binary.len() as u64)
}
