//! File discovery
//!
//! Expands root paths into the ordered set of files to analyse. Uses the
//! glob crate for matching and returns deterministically sorted results.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use veritas_core::DiscoverySettings;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Invalid glob pattern: {0}")]
    InvalidPattern(String),

    #[error("Root path does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Files selected for a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovered {
    /// Absolute paths, sorted and de-duplicated
    pub files: Vec<PathBuf>,
    /// Files that matched the include rules but were excluded
    pub excluded: u64,
}

/// Supplies the files a run analyses
pub trait FileDiscovery: Send + Sync {
    fn discover(&self, roots: &[PathBuf]) -> Result<Discovered, DiscoveryError>;
}

/// Extension filter plus exclude globs.
///
/// A root that is itself a file is always included. Exclude patterns are
/// matched against the path relative to its root and against the full path.
#[derive(Debug, Clone)]
pub struct GlobDiscovery {
    include_extensions: Vec<String>,
    exclude: Vec<glob::Pattern>,
}

impl GlobDiscovery {
    pub fn new(settings: &DiscoverySettings) -> Result<Self, DiscoveryError> {
        let exclude = settings
            .exclude
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| DiscoveryError::InvalidPattern(format!("{p}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            include_extensions: settings
                .include_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
            exclude,
        })
    }

    /// Glob patterns for `root`; the root itself is matched literally
    fn patterns(&self, root: &Path) -> Vec<String> {
        let base = PathBuf::from(glob::Pattern::escape(&root.to_string_lossy())).join("**");
        if self.include_extensions.is_empty() {
            return vec![base.join("*").to_string_lossy().into_owned()];
        }
        self.include_extensions
            .iter()
            .map(|ext| {
                base.join(format!("*.{}", glob::Pattern::escape(ext)))
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    fn is_excluded(&self, root: &Path, path: &Path) -> bool {
        let relative = path.strip_prefix(root).unwrap_or(path);
        self.exclude
            .iter()
            .any(|p| p.matches_path(relative) || p.matches_path(path))
    }
}

impl FileDiscovery for GlobDiscovery {
    fn discover(&self, roots: &[PathBuf]) -> Result<Discovered, DiscoveryError> {
        let mut files = BTreeSet::new();
        let mut excluded = 0u64;

        for root in roots {
            if !root.exists() {
                return Err(DiscoveryError::RootNotFound(root.clone()));
            }
            let root = root.canonicalize()?;

            if root.is_file() {
                files.insert(root);
                continue;
            }

            for pattern in self.patterns(&root) {
                let entries = glob::glob(&pattern)
                    .map_err(|e| DiscoveryError::InvalidPattern(e.to_string()))?;
                for entry in entries {
                    let path = match entry {
                        Ok(path) if path.is_file() => path,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("Skipping unreadable path: {e}");
                            continue;
                        }
                    };
                    if self.is_excluded(&root, &path) {
                        debug!("Excluded by discovery rules: {}", path.display());
                        excluded += 1;
                    } else {
                        files.insert(path);
                    }
                }
            }
        }

        info!("Discovered {} file(s), {excluded} excluded", files.len());
        Ok(Discovered {
            files: files.into_iter().collect(),
            excluded,
        })
    }
}
