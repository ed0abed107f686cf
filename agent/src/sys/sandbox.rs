// agent/src/sys/sandbox.rs

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use uuid::Uuid;

use crate::error::AgentError;

type ActiveKeys = Arc<Mutex<HashSet<String>>>;

/// Hands out per-deployment working directories under a single root.
///
/// A directory holds plan text, provider plugins and tool state for exactly one
/// execution. It is removed when the `Sandbox` guard is released or dropped,
/// whichever comes first, so every exit path (error, early return, panic
/// unwinding) cleans up.
#[derive(Clone)]
pub struct SandboxManager {
    root: PathBuf,
    active: ActiveKeys,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), active: Arc::default() }
    }

    /// Directory a given key maps to, whether or not it currently exists.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Acquires `<root>/<key>`. A second acquisition of a key that is still held
    /// is refused; a leftover directory from a crashed run is wiped first.
    pub async fn acquire(&self, key: &str) -> Result<Sandbox, AgentError> {
        // 🛡️ Zero-Trust Path Shield: keys become directory names.
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(AgentError::Precondition(format!("invalid sandbox key '{key}'")));
        }

        {
            let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
            if !active.insert(key.to_string()) {
                return Err(AgentError::Precondition(format!("sandbox '{key}' is already in use")));
            }
        }

        // From here on the guard owns both the registration and the directory.
        let sandbox = Sandbox {
            path: self.path_for(key),
            key: key.to_string(),
            active: Arc::clone(&self.active),
            released: false,
        };

        if fs::try_exists(&sandbox.path).await? {
            tracing::warn!(path = %sandbox.path.display(), "Removing stale sandbox");
            fs::remove_dir_all(&sandbox.path).await?;
        }
        fs::create_dir_all(&sandbox.path).await?;

        // 🛡️ rwx------ : plan text and tool state are readable by the agent only.
        let mut perms = fs::metadata(&sandbox.path).await?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&sandbox.path, perms).await?;

        tracing::debug!(path = %sandbox.path.display(), "Sandbox acquired");
        Ok(sandbox)
    }

    /// A throwaway directory with a unique key, for work that has no deployment id.
    pub async fn acquire_disposable(&self, label: &str) -> Result<Sandbox, AgentError> {
        self.acquire(&format!("{label}-{}", Uuid::new_v4().simple())).await
    }
}

pub struct Sandbox {
    path: PathBuf,
    key: String,
    active: ActiveKeys,
    released: bool,
}

impl Sandbox {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory now and reports failures. Dropping the guard
    /// without calling this still removes it.
    pub async fn release(mut self) -> std::io::Result<()> {
        self.released = true;
        let result = match fs::remove_dir_all(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
        if let Err(e) = &result {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to remove sandbox");
            // Leave the key registered: the directory is still on disk.
            self.released = false;
        }
        result
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.released {
            match std::fs::remove_dir_all(&self.path) {
                Ok(()) => tracing::debug!(path = %self.path.display(), "Sandbox removed on drop"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!(path = %self.path.display(), error = %e, "Failed to remove sandbox");
                }
            }
        }
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.key);
    }
}
