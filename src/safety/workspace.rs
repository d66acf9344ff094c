/// Per-execution workspaces
///
/// Every execution gets a fresh private directory under the configured root,
/// named after its execution id. A workspace is never reused: acquiring an id
/// whose directory already exists fails. Release removes the tree; dropping an
/// unreleased workspace removes it as a fallback.
use crate::config::types::{EngineError, Result};
use crate::safety::safe_cleanup;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Prefix of every workspace directory; sweeping ignores anything else
const WORKSPACE_PREFIX: &str = "exec-";

/// A private directory owned by one execution
#[derive(Debug)]
pub struct Workspace {
    execution_id: String,
    path: PathBuf,
    active: Arc<AtomicUsize>,
    released: bool,
}

impl Workspace {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a file directly inside the workspace.
    ///
    /// `name` must be a plain file name; separators and `..` are rejected.
    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(EngineError::Workspace(format!(
                "Invalid workspace file name: {:?}",
                name
            )));
        }

        let file_path = self.path.join(name);
        fs::write(&file_path, content).map_err(|e| {
            EngineError::Workspace(format!(
                "Failed to write {}: {}",
                file_path.display(),
                e
            ))
        })?;
        Ok(file_path)
    }

    fn remove(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.active.fetch_sub(1, Ordering::SeqCst);
        safe_cleanup::remove_tree_secure(&self.path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.remove() {
                log::warn!(
                    "Failed to remove workspace {} on drop: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Creates, releases, and sweeps workspaces under one root
pub struct WorkspaceManager {
    root: PathBuf,
    active: Arc<AtomicUsize>,
}

impl WorkspaceManager {
    /// Create the manager, creating the root (mode 0700) if needed
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).map_err(|e| {
            EngineError::Workspace(format!(
                "Failed to create workspace root {}: {}",
                root.display(),
                e
            ))
        })?;
        fs::set_permissions(&root, fs::Permissions::from_mode(0o700)).map_err(|e| {
            EngineError::Workspace(format!(
                "Failed to restrict workspace root {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Self {
            root,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of acquired, not yet released workspaces
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Create a fresh workspace for `execution_id`
    pub fn acquire(&self, execution_id: &str) -> Result<Workspace> {
        if execution_id.is_empty()
            || !execution_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(EngineError::Workspace(format!(
                "Invalid execution id for workspace: {:?}",
                execution_id
            )));
        }

        let path = self.root.join(format!("{}{}", WORKSPACE_PREFIX, execution_id));

        // create_dir, not create_dir_all: an existing directory means reuse
        fs::create_dir(&path).map_err(|e| {
            EngineError::Workspace(format!(
                "Failed to create workspace {}: {}",
                path.display(),
                e
            ))
        })?;

        let workspace = Workspace {
            execution_id: execution_id.to_string(),
            path,
            active: Arc::clone(&self.active),
            released: false,
        };
        self.active.fetch_add(1, Ordering::SeqCst);

        fs::set_permissions(&workspace.path, fs::Permissions::from_mode(0o700)).map_err(|e| {
            EngineError::Workspace(format!(
                "Failed to restrict workspace {}: {}",
                workspace.path.display(),
                e
            ))
        })?;

        log::debug!("Acquired workspace {}", workspace.path.display());
        Ok(workspace)
    }

    /// Remove a workspace and everything in it
    pub fn release(&self, mut workspace: Workspace) -> Result<()> {
        let result = workspace.remove();
        match &result {
            Ok(()) => log::debug!("Released workspace {}", workspace.path.display()),
            Err(e) => log::warn!(
                "Failed to remove workspace {}: {}",
                workspace.path.display(),
                e
            ),
        }
        result
    }

    /// Remove leftover workspaces older than `max_age`.
    ///
    /// Leftovers come from a crashed engine; live executions are always
    /// younger than the hard timeout ceiling.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let mut cleaned = 0;
        let now = SystemTime::now();

        let entries = fs::read_dir(&self.root).map_err(|e| {
            EngineError::Workspace(format!(
                "Failed to read workspace root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            if !entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX) {
                continue;
            }

            let path = entry.path();
            let metadata = match fs::symlink_metadata(&path) {
                Ok(m) if m.is_dir() => m,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Failed to get metadata for {}: {}", path.display(), e);
                    continue;
                }
            };

            let age = match metadata.modified().map(|m| now.duration_since(m)) {
                Ok(Ok(age)) => age,
                // Unknown or future timestamp
                _ => continue,
            };

            if age >= max_age {
                log::info!("Removing stale workspace: {}", path.display());
                match safe_cleanup::remove_tree_secure(&path) {
                    Ok(()) => cleaned += 1,
                    Err(e) => {
                        log::warn!("Failed to remove stale workspace {}: {}", path.display(), e)
                    }
                }
            }
        }

        Ok(cleaned)
    }
}
