//! Deployment tree layout

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Paths inside the deployment checkout
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Directory holding the compose file, `.env` and templates
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Deployment configuration file
    pub fn env_file(&self) -> File {
        File::new(self.base_dir.join(".env"))
    }

    /// Template copied to `.env` on first run
    pub fn env_template(&self) -> File {
        File::new(self.base_dir.join(".env.example"))
    }

    /// Proxy configuration templates
    pub fn templates_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("templates").join("nginx"))
    }

    /// Frontend working tree
    pub fn frontend_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("frontend"))
    }

    /// Backend working tree
    pub fn backend_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("backend"))
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::new(base_dir)
    }
}
