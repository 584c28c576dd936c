//! Temporary-file naming, kept behind a trait so the naming policy itself
//! stays an external concern (out of scope per the crate's purpose) while
//! streams still get a real, collision-free path to write to.

use crate::error::Result;
use std::path::PathBuf;

/// Produces unique paths for transient run/output streams.
pub trait TempPathProvider {
    /// Returns a path to a freshly created, empty, unique temp file. The
    /// file already exists on disk (so two calls can never race each other
    /// onto the same name); the caller owns deleting it.
    fn make_temp_path(&self) -> Result<PathBuf>;
}

/// Default provider, backed by the `tempfile` crate's atomic unique-name
/// allocation in the OS temp directory.
pub struct DefaultTempPathProvider {
    dir: Option<PathBuf>,
}

impl DefaultTempPathProvider {
    /// Uses the OS default temp directory.
    pub fn new() -> Self {
        DefaultTempPathProvider { dir: None }
    }

    /// Places temp files under `dir` instead of the OS default.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        DefaultTempPathProvider {
            dir: Some(dir.into()),
        }
    }
}

impl Default for DefaultTempPathProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TempPathProvider for DefaultTempPathProvider {
    fn make_temp_path(&self) -> Result<PathBuf> {
        let builder = tempfile::Builder::new();
        let named = match &self.dir {
            Some(dir) => builder.prefix("xmem-").tempfile_in(dir)?,
            None => builder.prefix("xmem-").tempfile()?,
        };
        let (_file, path) = named.into_parts();
        // `into_parts` detaches the auto-delete-on-drop guard; the stream
        // that opens this path owns its lifetime via its own persistence
        // policy from here on.
        path.keep()
            .map_err(|e| crate::error::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }
}
