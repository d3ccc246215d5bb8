//! Depth-first walk of the path handed to `send()`.
//!
//! The walk is lazy: a directory is listed only when it is reached, and the
//! sender pulls one entry at a time so it can wait for acknowledgements between
//! entries. An explicit stack replaces recursion.

use crate::error::{PushError, Result};
use crate::streaming::protocol::VirtualPath;
use std::path::{Path, PathBuf};
use tokio::fs;

/// One unit of work for the sender, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    Directory {
        path: PathBuf,
        /// Virtual path of this directory; its children are written under it.
        destination: VirtualPath,
        child_count: u16,
    },
    File {
        path: PathBuf,
        name: String,
        /// Virtual path of the containing directory.
        destination: VirtualPath,
        len: u64,
    },
}

enum Pending {
    Root(PathBuf),
    Directory {
        path: PathBuf,
        destination: VirtualPath,
    },
    File {
        path: PathBuf,
        name: String,
        destination: VirtualPath,
        len: u64,
    },
}

/// Generator state
pub struct Generator {
    stack: Vec<Pending>,
    skipped: u64,
}

impl Generator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            stack: vec![Pending::Root(root.into())],
            skipped: 0,
        }
    }

    /// Entries that were neither a regular file nor a directory.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Produce the next entry, or `None` once the walk is exhausted.
    pub async fn next(&mut self) -> Result<Option<WalkEntry>> {
        let Some(pending) = self.stack.pop() else {
            return Ok(None);
        };

        let entry = match pending {
            Pending::Root(path) => {
                let meta = fs::metadata(&path).await?;
                let name = entry_name(&path).await?;
                if meta.is_dir() {
                    self.expand(path, VirtualPath::root().join(&name)).await?
                } else if meta.is_file() {
                    WalkEntry::File {
                        path,
                        name,
                        destination: VirtualPath::root(),
                        len: meta.len(),
                    }
                } else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("{} is neither a file nor a directory", path.display()),
                    )
                    .into());
                }
            }
            Pending::Directory { path, destination } => self.expand(path, destination).await?,
            Pending::File {
                path,
                name,
                destination,
                len,
            } => WalkEntry::File {
                path,
                name,
                destination,
                len,
            },
        };

        Ok(Some(entry))
    }

    /// List a directory, queue its children and return its own entry.
    async fn expand(&mut self, path: PathBuf, destination: VirtualPath) -> Result<WalkEntry> {
        let mut children = Vec::new();
        let mut dir = fs::read_dir(&path).await?;
        while let Some(child) = dir.next_entry().await? {
            let name = child.file_name().into_string().map_err(|raw| {
                PushError::InvalidName(format!("non UTF-8 name {}", raw.to_string_lossy()))
            })?;
            children.push((name, child.path()));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let mut queued = Vec::with_capacity(children.len());
        for (name, child_path) in children {
            // Follows symlinks, like the listing the receiver would see.
            let meta = fs::metadata(&child_path).await?;
            if meta.is_file() {
                queued.push(Pending::File {
                    path: child_path,
                    name,
                    destination: destination.clone(),
                    len: meta.len(),
                });
            } else if meta.is_dir() {
                queued.push(Pending::Directory {
                    path: child_path,
                    destination: destination.join(&name),
                });
            } else {
                tracing::debug!("Skipping {}: not a file or directory", child_path.display());
                self.skipped += 1;
            }
        }

        let child_count = u16::try_from(queued.len()).unwrap_or_else(|_| {
            tracing::warn!(
                "{} has {} children, child count field saturates at {}",
                path.display(),
                queued.len(),
                u16::MAX
            );
            u16::MAX
        });

        self.stack.extend(queued.into_iter().rev());

        Ok(WalkEntry::Directory {
            path,
            destination,
            child_count,
        })
    }
}

/// Final component of a path as UTF-8, resolving `.` and friends.
pub(crate) async fn entry_name(path: &Path) -> Result<String> {
    let resolved;
    let name = match path.file_name() {
        Some(name) => name,
        None => {
            resolved = fs::canonicalize(path).await?;
            resolved
                .file_name()
                .ok_or_else(|| PushError::InvalidName(format!("{} has no name", path.display())))?
        }
    };
    name.to_str()
        .map(str::to_string)
        .ok_or_else(|| PushError::InvalidName(format!("non UTF-8 name {}", path.display())))
}
