//! Small plain-text state files kept outside the document store.
//!
//! Holds the "last active code" used to resume a session after restart.
//! Files are simple text, not versioned.

use std::path::{Path, PathBuf};

use crate::error::Result;

const LAST_CODE_FILE: &str = "last_code";
const IDENTITY_FILE: &str = "device.id";

/// Local state directory handle.
#[derive(Debug, Clone)]
pub struct LocalState {
    dir: PathBuf,
}

impl LocalState {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the persisted device identity.
    pub fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    fn last_code_path(&self) -> PathBuf {
        self.dir.join(LAST_CODE_FILE)
    }

    /// Remember the code of the most recent successful connection.
    pub fn save_last_code(&self, code: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.last_code_path(), code.trim())?;
        Ok(())
    }

    /// The last saved code, if any. Missing or blank files yield `None`.
    pub fn load_last_code(&self) -> Option<String> {
        std::fs::read_to_string(self.last_code_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Forget the last code.
    pub fn clear_last_code(&self) -> Result<()> {
        match std::fs::remove_file(self.last_code_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
