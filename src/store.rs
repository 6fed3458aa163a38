//! On-disk catalog of mock definition documents
//!
//! Documents are opaque to the control panel. The only things read out of
//! them are three optional metadata fields (`uuid`, `name`, `port`) used
//! for display; a document that is missing them, or cannot be parsed at all,
//! is still a perfectly valid entry in the catalog.

use crate::error::ControlError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Strip every `..`, `/` and `\` from a caller-supplied filename.
///
/// Applied until stable so removing one sequence can never assemble another.
pub fn sanitize_filename(name: &str) -> String {
    let mut current = name.to_string();
    loop {
        let next = current.replace("..", "").replace(['/', '\\'], "");
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Human-readable size with base 1024 ("0 B", "1.2 KB", "15 KB")
pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

    if size == 0 {
        return "0 B".to_string();
    }

    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if value < 10.0 {
        format!("{:.1} {}", value, UNITS[unit])
    } else {
        format!("{:.0} {}", value, UNITS[unit])
    }
}

/// A metadata field pulled out of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    /// Present with the expected type
    Present(T),
    /// Not in the document (or the document is not an object)
    Absent,
    /// Present with the wrong type or an out-of-range value
    Malformed,
}

impl<T> Field<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Field::Present(value) => Some(value),
            Field::Absent | Field::Malformed => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Field::Present(_))
    }
}

/// Display metadata of one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub id: Field<String>,
    pub name: Field<String>,
    pub port: Field<u16>,
}

impl DocumentMetadata {
    /// Metadata of a document that could not be parsed
    pub fn unparsable() -> Self {
        Self {
            id: Field::Absent,
            name: Field::Absent,
            port: Field::Absent,
        }
    }

    /// Extract metadata from raw document bytes
    pub fn parse(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::from_value(&value),
            Err(_) => Self::unparsable(),
        }
    }

    pub fn from_value(value: &Value) -> Self {
        let id = match string_field(value, "uuid") {
            Field::Absent => string_field(value, "id"),
            other => other,
        };

        let port = match value.get("port") {
            None | Some(Value::Null) => Field::Absent,
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .map(Field::Present)
                .unwrap_or(Field::Malformed),
            Some(_) => Field::Malformed,
        };

        Self {
            id,
            name: string_field(value, "name"),
            port,
        }
    }
}

fn string_field(value: &Value, key: &str) -> Field<String> {
    match value.get(key) {
        None | Some(Value::Null) => Field::Absent,
        Some(Value::String(s)) => Field::Present(s.clone()),
        Some(_) => Field::Malformed,
    }
}

/// One stored mock definition as reported to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(rename = "uuid", skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "configFile")]
    pub filename: String,
    /// Preferred port from the document (0 when absent)
    #[serde(skip_serializing_if = "is_zero")]
    pub port: u16,
    pub size: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    /// Derived from the instance registry by the caller
    pub in_use: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl ConfigFile {
    fn from_parts(
        filename: String,
        metadata: DocumentMetadata,
        size: u64,
        modified: DateTime<Utc>,
    ) -> Self {
        Self {
            display_id: metadata.id.into_option(),
            display_name: metadata.name.into_option().unwrap_or_default(),
            filename,
            port: metadata.port.into_option().unwrap_or(0),
            size: format_size(size),
            size_bytes: size,
            modified,
            in_use: false,
            url: None,
        }
    }
}

/// Directory of mock definition documents keyed by sanitized filename
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
    extension: String,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>, extension: impl AsRef<str>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.as_ref().trim_start_matches('.').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Whether a filename carries the recognized document extension
    pub fn has_document_extension(&self, filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == self.extension)
            .unwrap_or(false)
    }

    /// Absolute path of a document (sanitized)
    pub fn path(&self, filename: &str) -> PathBuf {
        let path = self.dir.join(sanitize_filename(filename));
        std::path::absolute(&path).unwrap_or(path)
    }

    pub fn exists(&self, filename: &str) -> bool {
        let name = sanitize_filename(filename);
        if name.is_empty() {
            return false;
        }
        fs::metadata(self.dir.join(name))
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// List every document in the store, sorted by filename
    pub fn list(&self) -> Result<Vec<ConfigFile>, ControlError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            ControlError::io(format!("failed to read config directory {}", self.dir.display()), e)
        })?;

        let mut configs = Vec::new();
        for entry in entries.flatten() {
            let filename = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            if !self.has_document_extension(&filename) {
                continue;
            }

            let metadata = match fs::read(entry.path()) {
                Ok(bytes) => DocumentMetadata::parse(&bytes),
                Err(e) => {
                    debug!(
                        file = %filename,
                        error = %e,
                        "Unreadable document, listing without metadata"
                    );
                    DocumentMetadata::unparsable()
                }
            };
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            configs.push(ConfigFile::from_parts(filename, metadata, meta.len(), modified));
        }

        configs.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(configs)
    }

    /// Copy a staged file into the store, overwriting any existing document
    pub fn save(&self, source: &Path, filename: &str) -> Result<String, ControlError> {
        let name = sanitize_filename(filename);
        if name.is_empty() {
            return Err(ControlError::InvalidInput("empty filename".to_string()));
        }
        if !source.is_file() {
            return Err(ControlError::NotFound(format!(
                "uploaded file not found: {}",
                source.display()
            )));
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| ControlError::io("failed to create config directory", e))?;
        fs::copy(source, self.dir.join(&name))
            .map_err(|e| ControlError::io(format!("failed to save configuration {}", name), e))?;

        info!(file = %name, "Configuration saved");
        Ok(name)
    }

    /// Stage raw bytes in `staging_dir` and save them under `filename`
    pub fn save_bytes(
        &self,
        staging_dir: &Path,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String, ControlError> {
        fs::create_dir_all(staging_dir)
            .map_err(|e| ControlError::io("failed to create upload directory", e))?;

        let mut staged = tempfile::NamedTempFile::new_in(staging_dir)
            .map_err(|e| ControlError::io("failed to stage upload", e))?;
        io::Write::write_all(&mut staged, bytes)
            .map_err(|e| ControlError::io("failed to stage upload", e))?;

        let result = self.save(staged.path(), filename);
        if let Err(e) = staged.close() {
            warn!(error = %e, "Failed to remove staged upload");
        }
        result
    }

    pub fn read(&self, filename: &str) -> Result<Vec<u8>, ControlError> {
        if !self.exists(filename) {
            return Err(not_found(filename));
        }
        fs::read(self.path(filename))
            .map_err(|e| ControlError::io(format!("failed to read configuration {}", filename), e))
    }

    /// Delete a document. Callers must check that no instance uses it.
    pub fn delete(&self, filename: &str) -> Result<(), ControlError> {
        if !self.exists(filename) {
            return Err(not_found(filename));
        }
        fs::remove_file(self.path(filename))
            .map_err(|e| {
                ControlError::io(format!("failed to delete configuration {}", filename), e)
            })?;

        info!(file = %sanitize_filename(filename), "Configuration deleted");
        Ok(())
    }
}

fn not_found(filename: &str) -> ControlError {
    ControlError::NotFound(format!("configuration file {} does not exist", filename))
}
