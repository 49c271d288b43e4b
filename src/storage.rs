//! On-disk layout of a certificate authority.
//!
//! ```text
//! <base>/
//!   ca-settings.toml
//!   ca.p12
//!   activity.log            (only when logging is enabled)
//!   Issued/    <serial>.p12 + <serial>.properties
//!   Revoked/   <serial>.p12 + <serial>.properties
//!   Requests/  <id>.csr     + <id>.properties
//!   X509CRL/   <serial>.crl + <serial>.properties
//!   Templates/ <id>.toml
//! ```
//!
//! Every file is replaced through a temp file and rename, and paired writes
//! (artifact + properties) roll back the first file when the second fails.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{CaError, Result};

pub const SETTINGS_FILE: &str = "ca-settings.toml";
pub const KEYSTORE_FILE: &str = "ca.p12";
pub const ACTIVITY_LOG_FILE: &str = "activity.log";
const PROPERTIES_EXTENSION: &str = "properties";

/// Paths that may never hold a CA.
const SYSTEM_PATHS: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/proc", "/sbin", "/sys", "/usr", "/var",
];

/// The per-CA artifact collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Issued,
    Revoked,
    Requests,
    Crls,
    Templates,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Self::Issued,
        Self::Revoked,
        Self::Requests,
        Self::Crls,
        Self::Templates,
    ];

    pub fn directory(&self) -> &'static str {
        match self {
            Self::Issued => "Issued",
            Self::Revoked => "Revoked",
            Self::Requests => "Requests",
            Self::Crls => "X509CRL",
            Self::Templates => "Templates",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Issued | Self::Revoked => "p12",
            Self::Requests => "csr",
            Self::Crls => "crl",
            Self::Templates => "toml",
        }
    }
}

/// Checks that `path` may hold a CA and returns its canonical form.
pub fn validate_base_path(path: &Path) -> Result<PathBuf> {
    let canonical = fs::canonicalize(path)
        .map_err(|e| CaError::io(format!("cannot resolve {}: {e}", path.display())))?;
    if !canonical.is_dir() {
        return Err(CaError::io(format!(
            "{} is not a directory",
            canonical.display()
        )));
    }
    if SYSTEM_PATHS.iter().any(|p| canonical == Path::new(p)) {
        return Err(CaError::io(format!(
            "refusing to use system directory {}",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Replaces `path` with `contents` via a temp file in the same directory.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CaError::io(format!("{} has no parent directory", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CaError::from(e.error))?;
    Ok(())
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => CaError::not_found(format!("{what} ({})", path.display())),
        _ => CaError::from(e),
    })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct CaStorage {
    base: PathBuf,
}

impl CaStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn settings_path(&self) -> PathBuf {
        self.base.join(SETTINGS_FILE)
    }

    pub fn keystore_path(&self, filename: &str) -> PathBuf {
        self.base.join(filename)
    }

    pub fn activity_log_path(&self) -> PathBuf {
        self.base.join(ACTIVITY_LOG_FILE)
    }

    pub fn directory(&self, collection: Collection) -> PathBuf {
        self.base.join(collection.directory())
    }

    pub fn artifact_path(&self, collection: Collection, stem: &str) -> PathBuf {
        self.directory(collection)
            .join(format!("{stem}.{}", collection.extension()))
    }

    pub fn properties_path(&self, collection: Collection, stem: &str) -> PathBuf {
        self.directory(collection)
            .join(format!("{stem}.{PROPERTIES_EXTENSION}"))
    }

    /// Creates the collection directories.
    pub fn create_layout(&self) -> Result<()> {
        for collection in Collection::ALL {
            fs::create_dir_all(self.directory(collection))?;
        }
        Ok(())
    }

    /// Fails unless files can be created in the base directory.
    pub fn check_writable(&self) -> Result<()> {
        tempfile::tempfile_in(&self.base).map_err(|e| CaError::IoFailure {
            message: format!("{} is not writable", self.base.display()),
            source: Some(e),
        })?;
        Ok(())
    }

    pub fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        debug!(path = %path.display(), bytes = contents.len(), "writing file");
        write_atomic(path, contents)
    }

    /// Writes an artifact and its properties. The artifact is removed again
    /// when the properties cannot be written.
    pub fn store_artifact(
        &self,
        collection: Collection,
        stem: &str,
        artifact: &[u8],
        properties: &str,
    ) -> Result<()> {
        let artifact_path = self.artifact_path(collection, stem);
        self.write_file(&artifact_path, artifact)?;
        if let Err(e) = self.write_file(&self.properties_path(collection, stem), properties.as_bytes())
        {
            // Roll back the artifact so the collection stays consistent
            let _ = fs::remove_file(&artifact_path);
            return Err(e);
        }
        Ok(())
    }

    /// Writes a single-file entry such as a template.
    pub fn store_document(&self, collection: Collection, stem: &str, document: &str) -> Result<()> {
        self.write_file(&self.artifact_path(collection, stem), document.as_bytes())
    }

    pub fn write_properties(&self, collection: Collection, stem: &str, properties: &str) -> Result<()> {
        self.write_file(&self.properties_path(collection, stem), properties.as_bytes())
    }

    pub fn read_artifact(&self, collection: Collection, stem: &str) -> Result<Vec<u8>> {
        read_file(&self.artifact_path(collection, stem), stem)
    }

    pub fn read_properties(&self, collection: Collection, stem: &str) -> Result<String> {
        let bytes = read_file(&self.properties_path(collection, stem), stem)?;
        String::from_utf8(bytes)
            .map_err(|_| CaError::io(format!("properties of {stem} are not UTF-8")))
    }

    /// Deletes an artifact and its properties file.
    pub fn remove_artifact(&self, collection: Collection, stem: &str) -> Result<()> {
        remove_if_exists(&self.artifact_path(collection, stem))?;
        remove_if_exists(&self.properties_path(collection, stem))?;
        debug!(collection = collection.directory(), stem, "removed artifact");
        Ok(())
    }

    /// Moves an artifact between collections, writing `properties` as its
    /// new properties file. Nothing is left behind in the target collection
    /// if the move fails.
    pub fn move_artifact(
        &self,
        from: Collection,
        to: Collection,
        stem: &str,
        properties: &str,
    ) -> Result<()> {
        let target_properties = self.properties_path(to, stem);
        self.write_file(&target_properties, properties.as_bytes())?;
        if let Err(e) = fs::rename(self.artifact_path(from, stem), self.artifact_path(to, stem)) {
            let _ = fs::remove_file(&target_properties);
            return Err(e.into());
        }
        remove_if_exists(&self.properties_path(from, stem))?;
        debug!(from = from.directory(), to = to.directory(), stem, "moved artifact");
        Ok(())
    }

    /// Stems of the artifacts in a collection, sorted.
    pub fn list_stems(&self, collection: Collection) -> Result<Vec<String>> {
        let dir = self.directory(collection);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut stems = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(collection.extension()) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }

    pub fn append_activity(&self, line: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.activity_log_path())?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
