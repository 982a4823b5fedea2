//! Sandbox runtime seam
//!
//! The engine never runs commands itself. It asks a [`SandboxRuntime`] to
//! create, snapshot and destroy sandboxes, and to hand over the terminal
//! transcript captured since the last reset. [`LocalSandboxRuntime`] backs
//! each sandbox with a plain directory, which is enough for offline checks
//! and tests.

use crate::error::SandboxError;
use crate::model::TaskSessionId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use termtask_snapshot::{materialize, snapshot_dir, Attribute, FsNode, MaterializeStatus};

/// Opaque reference to a live sandbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxHandle(String);

impl SandboxHandle {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SandboxHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates, inspects and destroys sandboxes
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Start a sandbox whose home holds `initial`
    async fn create_sandbox(
        &self,
        owner: &TaskSessionId,
        initial: &FsNode,
    ) -> Result<SandboxHandle, SandboxError>;

    /// Tear a sandbox down
    async fn destroy_sandbox(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Current home tree, restricted to `attributes`
    async fn snapshot(
        &self,
        handle: &SandboxHandle,
        attributes: &[Attribute],
    ) -> Result<FsNode, SandboxError>;

    /// Terminal transcript since creation
    async fn current_stdout(&self, handle: &SandboxHandle) -> Result<String, SandboxError>;
}

#[derive(Debug)]
struct LocalSandbox {
    dir: PathBuf,
    root: PathBuf,
}

/// Directory-backed runtime
///
/// Each sandbox is a fresh directory under `base`; the seed tree is written
/// into it and snapshots are taken from the seed's root directory.
#[derive(Debug)]
pub struct LocalSandboxRuntime {
    base: PathBuf,
    live: DashMap<String, LocalSandbox>,
    transcripts: Mutex<HashMap<String, String>>,
}

impl LocalSandboxRuntime {
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            live: DashMap::new(),
            transcripts: Mutex::new(HashMap::new()),
        }
    }

    /// Home root on disk of a live sandbox
    #[must_use]
    pub fn root_of(&self, handle: &SandboxHandle) -> Option<PathBuf> {
        self.live.get(handle.as_str()).map(|s| s.root.clone())
    }

    /// Append terminal output relayed from the sandbox
    ///
    /// # Errors
    /// Returns error if the sandbox is not live
    pub fn record_output(&self, handle: &SandboxHandle, text: &str) -> Result<(), SandboxError> {
        let mut transcripts = self.transcripts.lock();
        let transcript = transcripts
            .get_mut(handle.as_str())
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;
        transcript.push_str(text);
        Ok(())
    }

    /// Number of live sandboxes
    #[inline]
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

async fn blocking<T, F>(job: F) -> Result<T, SandboxError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SandboxError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| SandboxError::Unavailable(format!("worker failed: {e}")))?
}

fn seed(dir: &Path, initial: &FsNode) -> Result<(), SandboxError> {
    std::fs::create_dir_all(dir)?;
    match materialize(initial, dir) {
        MaterializeStatus::Written | MaterializeStatus::Empty => Ok(()),
        MaterializeStatus::RootMissing => Err(SandboxError::CreationFailed(format!(
            "{} vanished while seeding",
            dir.display()
        ))),
        MaterializeStatus::Io(detail) => Err(SandboxError::CreationFailed(detail)),
    }
}

#[async_trait]
impl SandboxRuntime for LocalSandboxRuntime {
    async fn create_sandbox(
        &self,
        owner: &TaskSessionId,
        initial: &FsNode,
    ) -> Result<SandboxHandle, SandboxError> {
        let handle = SandboxHandle::new(uuid::Uuid::new_v4().simple().to_string());
        let dir = self.base.join(handle.as_str());
        let root = dir.join(initial.name());

        let tree = initial.clone();
        let target = dir.clone();
        blocking(move || seed(&target, &tree)).await?;

        self.transcripts.lock().insert(handle.as_str().to_string(), String::new());
        self.live.insert(handle.as_str().to_string(), LocalSandbox { dir, root });
        tracing::info!(sandbox = %handle, owner = %owner, "sandbox created");
        Ok(handle)
    }

    async fn destroy_sandbox(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let (_, sandbox) = self
            .live
            .remove(handle.as_str())
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;
        self.transcripts.lock().remove(handle.as_str());
        blocking(move || std::fs::remove_dir_all(&sandbox.dir).map_err(SandboxError::from)).await?;
        tracing::info!(sandbox = %handle, "sandbox destroyed");
        Ok(())
    }

    async fn snapshot(
        &self,
        handle: &SandboxHandle,
        attributes: &[Attribute],
    ) -> Result<FsNode, SandboxError> {
        let root = self
            .root_of(handle)
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;
        let attributes = attributes.to_vec();
        blocking(move || snapshot_dir(&root, &attributes).map_err(SandboxError::from)).await
    }

    async fn current_stdout(&self, handle: &SandboxHandle) -> Result<String, SandboxError> {
        self.transcripts
            .lock()
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))
    }
}
