//! On-disk project state: one directory per key holding at most one manifest.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// File name of the rendered manifest inside a project directory.
pub const MANIFEST_FILE: &str = "docker-compose.yml";

/// Derive a project name from a control-plane key.
///
/// The result is a valid compose project name and a single path component:
/// lowercase, limited to `[a-z0-9_-]`, starting with a letter or digit.
pub fn project_name_for_key(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '_' | '-') => c,
            _ => '_',
        })
        .collect();

    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        name.insert(0, 'x');
    }
    name
}

/// The filesystem side of one managed compose project.
///
/// The presence of the manifest file is the durable record that the project
/// is supposed to be running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    name: String,
    dir: PathBuf,
}

impl Project {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    /// The project for `key` under `work_dir`.
    pub fn for_key(work_dir: &Path, key: &str) -> Self {
        let name = project_name_for_key(key);
        let dir = work_dir.join(&name);
        Self { name, dir }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn has_manifest(&self) -> bool {
        self.manifest_path().is_file()
    }

    /// Read back the currently applied manifest, if any.
    pub fn read_manifest(&self) -> io::Result<Option<String>> {
        match std::fs::read_to_string(self.manifest_path()) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the manifest atomically.
    ///
    /// Content goes to a temporary file in the project directory which is then
    /// renamed over the manifest, so readers see either the old or the new
    /// file, never a partial one.
    pub fn write_manifest(&self, content: &str) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.manifest_path()).map_err(|e| e.error)?;
        Ok(())
    }

    /// Remove the manifest. Returns whether a file was actually removed.
    pub fn remove_manifest(&self) -> io::Result<bool> {
        match std::fs::remove_file(self.manifest_path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
