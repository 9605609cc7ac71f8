//! Workspace management for per-request artifacts
//!
//! Every execution gets a fresh directory under the workspace root, named
//! after its request id. A workspace is released exactly once: explicitly via
//! [`Workspace::release`], or from `Drop` when the owning future is torn down.
//! Directories left behind by a crashed process are reclaimed by the stale
//! sweep.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RunnerError, RunnerResult};

const WORKSPACE_PREFIX: &str = "run-";

#[derive(Debug, Default)]
struct Ledger {
    sequence: AtomicU64,
    created: AtomicU64,
    released: AtomicU64,
    live: Mutex<HashSet<PathBuf>>,
}

impl Ledger {
    fn live_snapshot(&self) -> HashSet<PathBuf> {
        match self.live.lock() {
            Ok(live) => live.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_live(&self, path: &Path, live: bool) {
        let mut guard = match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if live {
            guard.insert(path.to_path_buf());
        } else {
            guard.remove(path);
        }
    }
}

/// Allocates and reclaims workspaces under a single root directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    ledger: Arc<Ledger>,
}

impl WorkspaceManager {
    /// Create the manager, creating the root directory if needed
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create workspace root {:?}", root))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve workspace root {:?}", root))?;

        Ok(Self {
            root,
            ledger: Arc::new(Ledger::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, empty workspace for a request
    pub async fn acquire(&self, request_id: Uuid) -> RunnerResult<Workspace> {
        let sequence = self.ledger.sequence.fetch_add(1, Ordering::Relaxed);
        let path = self.root.join(format!(
            "{}{}-{}",
            WORKSPACE_PREFIX,
            request_id.simple(),
            sequence
        ));

        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| RunnerError::exhausted("failed to create workspace", e))?;

        self.ledger.set_live(&path, true);
        self.ledger.created.fetch_add(1, Ordering::Relaxed);
        debug!("Acquired workspace {:?} for request {}", path, request_id);

        Ok(Workspace {
            request_id,
            path,
            released: false,
            ledger: Arc::clone(&self.ledger),
        })
    }

    /// Number of workspaces ever created
    pub fn created(&self) -> u64 {
        self.ledger.created.load(Ordering::Relaxed)
    }

    /// Number of workspaces released
    pub fn released(&self) -> u64 {
        self.ledger.released.load(Ordering::Relaxed)
    }

    /// Workspaces currently owned by a request
    pub fn in_flight(&self) -> usize {
        self.ledger.live_snapshot().len()
    }

    /// Remove workspace directories older than `grace` that no live request owns
    pub async fn sweep_stale(&self, grace: Duration) -> Result<usize> {
        let root = self.root.clone();
        let live = self.ledger.live_snapshot();

        tokio::task::spawn_blocking(move || sweep_blocking(&root, &live, grace))
            .await
            .context("Workspace sweep task failed")?
            .with_context(|| format!("Failed to sweep workspace root {:?}", self.root))
    }

    /// Periodically sweep stale workspaces until `cancel` fires
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        grace: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match manager.sweep_stale(grace).await {
                    Ok(0) => {}
                    Ok(removed) => info!("Swept {} stale workspaces", removed),
                    Err(e) => warn!("Workspace sweep failed: {:#}", e),
                }
            }
            debug!("Workspace sweeper stopped");
        })
    }
}

/// An exclusively owned, ephemeral directory for one execution request
#[derive(Debug)]
pub struct Workspace {
    request_id: Uuid,
    path: PathBuf,
    released: bool,
    ledger: Arc<Ledger>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the source file into the workspace
    pub async fn write_source(&self, file_name: &str, content: &[u8]) -> RunnerResult<PathBuf> {
        if file_name.is_empty() || file_name.contains('/') {
            return Err(RunnerError::ResourceExhausted(format!(
                "invalid source file name {:?}",
                file_name
            )));
        }

        let source_path = self.path.join(file_name);
        tokio::fs::write(&source_path, content)
            .await
            .map_err(|e| RunnerError::exhausted("failed to write source file", e))?;
        Ok(source_path)
    }

    /// Recursively remove the workspace
    ///
    /// Idempotent, and a directory already (partially) removed by someone else
    /// is not an error.
    pub async fn release(mut self) -> std::io::Result<()> {
        let request_id = self.request_id;
        let result = tokio::task::spawn_blocking(move || self.close())
            .await
            .map_err(std::io::Error::other)?;
        debug!("Released workspace for request {}", request_id);
        result
    }

    fn close(&mut self) -> std::io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let result = remove_tree(&self.path);
        self.ledger.set_live(&self.path, false);
        self.ledger.released.fetch_add(1, Ordering::Relaxed);
        result
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        debug!(
            "Workspace {:?} dropped without explicit release, removing",
            self.path
        );
        if let Err(e) = self.close() {
            warn!("Failed to remove workspace {:?}: {}", self.path, e);
        }
    }
}

fn sweep_blocking(root: &Path, live: &HashSet<PathBuf>, grace: Duration) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();

        let is_workspace = entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(WORKSPACE_PREFIX))
            .unwrap_or(false);
        if !is_workspace || live.contains(&path) {
            continue;
        }

        let metadata = match std::fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => metadata,
            _ => continue,
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < grace {
            continue;
        }

        match remove_tree(&path) {
            Ok(()) => {
                debug!("Removed stale workspace {:?} (age {:?})", path, age);
                removed += 1;
            }
            Err(e) => warn!("Failed to remove stale workspace {:?}: {}", path, e),
        }
    }

    Ok(removed)
}

/// Remove a directory tree, tolerating concurrent removal and restoring
/// permissions a program may have stripped from its own files
fn remove_tree(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound && !path.exists() => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied || e.kind() == ErrorKind::NotFound => {
            restore_permissions(path);
            match std::fs::remove_dir_all(path) {
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            }
        }
        Err(e) => Err(e),
    }
}

fn restore_permissions(path: &Path) {
    let is_dir = std::fs::symlink_metadata(path)
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return;
    }

    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            restore_permissions(&entry.path());
        }
    }
}
