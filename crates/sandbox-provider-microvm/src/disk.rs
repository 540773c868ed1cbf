//! Sparse data-disk creation and copy-on-write-preferring duplication for
//! snapshots, mirroring the reflink-then-fallback pattern the teacher uses
//! for fast VM provisioning.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tokio::process::Command;

pub struct DiskLayout {
    pub data_dir: PathBuf,
}

impl DiskLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.data_dir.join("sockets")
    }

    pub fn disks_dir(&self) -> PathBuf {
        self.data_dir.join("disks")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn vm_disk_path(&self, vm_id: &str) -> PathBuf {
        self.disks_dir().join(format!("{vm_id}-data.ext4"))
    }

    pub fn vm_socket_path(&self, vm_id: &str) -> PathBuf {
        self.sockets_dir().join(format!("{vm_id}.sock"))
    }

    pub fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir().join(snapshot_id)
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.sockets_dir(), self.disks_dir(), self.snapshots_dir()] {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Creates a sparse ext4-formatted disk of `size_bytes` at `path`.
pub async fn create_data_disk(path: &Path, size_bytes: u64) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("creating sparse file {}", path.display()))?;
    file.set_len(size_bytes)
        .with_context(|| format!("sizing sparse file {}", path.display()))?;
    drop(file);

    let status = Command::new("mkfs.ext4")
        .arg("-q")
        .arg(path)
        .status()
        .await
        .context("spawning mkfs.ext4")?;
    if !status.success() {
        let _ = tokio::fs::remove_file(path).await;
        anyhow::bail!("mkfs.ext4 failed for {}", path.display());
    }
    Ok(())
}

/// Duplicates `source` into `dest`, preferring a copy-on-write reflink
/// (`cp --reflink=auto`) and falling back to a byte-for-byte copy when the
/// underlying filesystem doesn't support it.
pub async fn reflink_or_copy(source: &Path, dest: &Path) -> Result<()> {
    let reflink = Command::new("cp")
        .arg("--reflink=auto")
        .arg(source)
        .arg(dest)
        .status()
        .await;
    if let Ok(status) = reflink {
        if status.success() {
            return Ok(());
        }
    }
    fs::copy(source, dest)
        .await
        .with_context(|| format!("copying {} to {}", source.display(), dest.display()))?;
    Ok(())
}

pub async fn remove_disk(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing disk {}", path.display())),
    }
}

pub async fn remove_dir_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing directory {}", path.display())),
    }
}
