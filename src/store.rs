use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::{Builder, NamedTempFile, TempPath};

use crate::domain::{ArtifactKind, Uid};
use crate::error::BeaconError;

/// Sharded artifact layout: `{work_dir}/{uid[0:2]}/{uid}{suffix}`.
#[derive(Debug, Clone)]
pub struct Workspace {
    work_dir: Utf8PathBuf,
}

impl Workspace {
    pub fn new(work_dir: Utf8PathBuf) -> Self {
        Self { work_dir }
    }

    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    pub fn shard_dir(&self, uid: &Uid) -> Utf8PathBuf {
        self.work_dir.join(uid.shard())
    }

    pub fn artifact_path(&self, uid: &Uid, kind: ArtifactKind) -> Utf8PathBuf {
        resolve_path(&self.work_dir, uid, kind.suffix())
    }

    /// Like [`Workspace::artifact_path`] but creates the shard directory.
    pub fn ensure_artifact_path(
        &self,
        uid: &Uid,
        kind: ArtifactKind,
    ) -> Result<Utf8PathBuf, BeaconError> {
        ensure_path(&self.work_dir, uid, kind.suffix())
    }

    pub fn ensure_work_dir(&self) -> Result<(), BeaconError> {
        fs::create_dir_all(self.work_dir.as_std_path()).map_err(|err| {
            BeaconError::Filesystem(format!("create {}: {err}", self.work_dir))
        })
    }
}

pub fn resolve_path(base: &Utf8Path, uid: &Uid, suffix: &str) -> Utf8PathBuf {
    base.join(uid.shard()).join(format!("{uid}{suffix}"))
}

pub fn ensure_path(base: &Utf8Path, uid: &Uid, suffix: &str) -> Result<Utf8PathBuf, BeaconError> {
    let path = resolve_path(base, uid, suffix);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| BeaconError::Filesystem(format!("create {parent}: {err}")))?;
    }
    Ok(path)
}

/// An artifact only counts once it is a non-empty regular file.
pub fn artifact_present(path: &Utf8Path) -> bool {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Temp file in the same directory as `dest`, so the final rename stays on
/// one filesystem.
pub fn sibling_tempfile(dest: &Utf8Path) -> Result<NamedTempFile, BeaconError> {
    let parent = dest
        .parent()
        .ok_or_else(|| BeaconError::Filesystem(format!("invalid destination path {dest}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| BeaconError::Filesystem(format!("create {parent}: {err}")))?;
    let prefix = format!(".{}", dest.file_name().unwrap_or("artifact"));
    Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| BeaconError::Filesystem(format!("tempfile in {parent}: {err}")))
}

pub fn publish(temp: NamedTempFile, dest: &Utf8Path) -> Result<(), BeaconError> {
    temp.persist(dest.as_std_path())
        .map_err(|err| BeaconError::Filesystem(format!("publish {dest}: {err}")))?;
    Ok(())
}

/// Same as [`publish`] for a temp file whose handle was already closed so an
/// external program could write it.
pub fn publish_path(temp: TempPath, dest: &Utf8Path) -> Result<(), BeaconError> {
    temp.persist(dest.as_std_path())
        .map_err(|err| BeaconError::Filesystem(format!("publish {dest}: {err}")))?;
    Ok(())
}

pub fn write_bytes_atomic(dest: &Utf8Path, content: &[u8]) -> Result<(), BeaconError> {
    let mut temp = sibling_tempfile(dest)?;
    temp.write_all(content)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| BeaconError::Filesystem(format!("write {dest}: {err}")))?;
    publish(temp, dest)
}

pub fn write_json_atomic<T: Serialize>(dest: &Utf8Path, value: &T) -> Result<(), BeaconError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| BeaconError::Filesystem(err.to_string()))?;
    write_bytes_atomic(dest, &content)
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), BeaconError> {
    let temp = sibling_tempfile(dest)?;
    fs::copy(source.as_std_path(), temp.path())
        .map_err(|err| BeaconError::Filesystem(format!("copy {source} -> {dest}: {err}")))?;
    publish(temp, dest)
}
