//! Run directory naming and layout.
//!
//! Every training run gets a directory whose name is the ordered list of
//! labels and resolved parameter values, so two configurations can never
//! collide and a directory name alone reproduces the setup.

use std::fmt;
use std::path::{Path, PathBuf};

/// Base path plus ordered name fragments.
#[derive(Debug, Clone)]
pub struct RunDir {
    base: PathBuf,
    fragments: Vec<String>,
}

impl RunDir {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            fragments: Vec::new(),
        }
    }

    /// Append a free-form label fragment.
    pub fn with_label(mut self, label: &str) -> Self {
        self.fragments.push(label.to_string());
        self
    }

    /// Append a `name{value}` fragment for a resolved parameter.
    pub fn with_param(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.fragments.push(format!("{name}{value}"));
        self
    }

    /// Resolve a parameter from the environment, falling back to the
    /// default, and always record the resolved value in the name.
    pub fn env_override_f64(self, name: &str, default: f64) -> (Self, f64) {
        let value = std::env::var(name)
            .ok()
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(default);
        (self.with_param(name, value), value)
    }

    /// The run directory path.
    pub fn path(&self) -> PathBuf {
        if self.fragments.is_empty() {
            self.base.join("run")
        } else {
            self.base.join(self.fragments.join("_"))
        }
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.path().join("checkpoints")
    }

    /// Path of a named artifact inside the run directory.
    pub fn artifact(&self, file_name: &str) -> PathBuf {
        self.path().join(file_name)
    }

    /// Create the run directory tree.
    pub fn create(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.checkpoints_dir()).map_err(|e| {
            anyhow::anyhow!("Failed to create run directory {}: {e}", self.path().display())
        })?;
        Ok(())
    }
}

impl AsRef<Path> for RunDir {
    fn as_ref(&self) -> &Path {
        &self.base
    }
}
