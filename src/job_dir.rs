//! Per-request scratch directories.
//!
//! A [`JobDir`] is created fresh for every download and removed exactly once:
//! either explicitly through [`JobDir::remove`] or, when the owning request is
//! dropped (client disconnect, finished body stream), from `Drop`.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};
use uuid::Uuid;

pub const JOB_DIR_PREFIX: &str = "vd-";

#[derive(Debug)]
pub struct JobDir {
    path: PathBuf,
    armed: bool,
}

impl JobDir {
    /// Creates `<root>/vd-<uuid>`. The directory must not exist beforehand, so
    /// two requests can never share one.
    pub async fn create(root: &Path) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let path = root.join(format!("{JOB_DIR_PREFIX}{}", Uuid::new_v4()));
        tokio::fs::create_dir(&path).await?;
        debug!("Created job directory {:?}", path);
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        self.armed = false;
        if let Err(error) = tokio::fs::remove_dir_all(&self.path).await
            && error.kind() != ErrorKind::NotFound
        {
            debug!("Could not remove job directory {:?}: {error}", self.path);
        }
    }
}

impl Drop for JobDir {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_quietly(&path));
            }
            Err(_) => remove_quietly(&path),
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(error) = std::fs::remove_dir_all(path)
        && error.kind() != ErrorKind::NotFound
    {
        debug!("Could not remove job directory {:?}: {error}", path);
    }
}

/// Removes `vd-*` directories under `root` older than `older_than_secs`, left
/// behind when the process died mid-request.
pub async fn cleanup_stale_job_dirs(root: &Path, older_than_secs: u64) {
    if older_than_secs == 0 {
        return;
    }

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open temp root for cleanup: {error}");
            }
            return;
        }
    };

    let max_age = Duration::from_secs(older_than_secs);
    let now = SystemTime::now();
    let mut removed = 0usize;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate temp root for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        let is_job_dir = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(JOB_DIR_PREFIX));
        if !is_job_dir {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };
        if !metadata.is_dir() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove stale job directory {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!("Removed {removed} stale job director(ies) from {:?}", root);
    }
}
