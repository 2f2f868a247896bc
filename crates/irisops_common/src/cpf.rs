//! CPF configuration store
//!
//! The CPF is an INI-style file: `[Section]` headers followed by `key=value`
//! lines, with `;` or `#` comments. Section names are case-sensitive, keys are
//! looked up case-insensitively and keep the spelling they were written with.
//! Comments, blank lines and ordering survive a rewrite.
//!
//! Writes are transactional:
//!
//! 1. snapshot the whole file into `<cpf dir>/backups/` (abort if this fails)
//! 2. parse, set the value (creating the section if needed)
//! 3. persist through a temp file in the same directory, fsync, rename
//! 4. re-read and parse what landed on disk
//!
//! Any failure after the snapshot restores it. Backups carry a SHA-256 of
//! their content, checked before a restore overwrites the live file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

/// Sections whose every key needs an instance restart
pub const RESTART_SECTIONS: &[&str] = &["Startup", "config"];

/// Keys that need a restart wherever they appear (compared lowercased)
pub const RESTART_KEYS: &[&str] = &[
    "globals",
    "routines",
    "gmheap",
    "locksiz",
    "genericheap",
    "wijdir",
    "database",
];

const BACKUP_DIR_NAME: &str = "backups";
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_BACKUP_SUFFIX: u32 = 1000;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Cannot read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    #[error("Write failed: {reason}")]
    WriteFailed {
        reason: String,
        backup: Option<BackupRef>,
        rolled_back: bool,
    },

    #[error("Validation failed after write: {reason}")]
    ValidationFailed {
        reason: String,
        backup: Option<BackupRef>,
        rolled_back: bool,
    },

    #[error("Restore from {} failed: {reason}", path.display())]
    RestoreFailed { path: PathBuf, reason: String },

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
}

impl StoreError {
    /// Backup taken before the failure, if any
    pub fn backup(&self) -> Option<&BackupRef> {
        match self {
            Self::WriteFailed { backup, .. } | Self::ValidationFailed { backup, .. } => {
                backup.as_ref()
            }
            _ => None,
        }
    }

    pub fn rolled_back(&self) -> bool {
        match self {
            Self::WriteFailed { rolled_back, .. } | Self::ValidationFailed { rolled_back, .. } => {
                *rolled_back
            }
            _ => false,
        }
    }
}

/// Why `section`/`key` would not read back as the same entry, if they would not
pub fn entry_problem(section: &str, key: &str) -> Option<String> {
    if section.is_empty() {
        return Some("section name must not be empty".to_string());
    }
    if section.trim() != section {
        return Some(format!("section name '{}' has surrounding whitespace", section.escape_debug()));
    }
    if section.contains(|c: char| c == '[' || c == ']' || c.is_control()) {
        return Some(format!(
            "section name '{}' must not contain brackets or control characters",
            section.escape_debug()
        ));
    }
    if key.is_empty() {
        return Some("key must not be empty".to_string());
    }
    if key.trim() != key {
        return Some(format!("key '{}' has surrounding whitespace", key.escape_debug()));
    }
    if key.starts_with(|c: char| c == ';' || c == '#' || c == '[') {
        return Some(format!("key '{}' would be read as a comment or section header", key.escape_debug()));
    }
    if key.contains(|c: char| c == '=' || c.is_control()) {
        return Some(format!("key '{}' must not contain '=' or control characters", key.escape_debug()));
    }
    None
}

fn check_entry(section: &str, key: &str) -> Result<(), StoreError> {
    match entry_problem(section, key) {
        Some(problem) => Err(StoreError::InvalidEntry(problem)),
        None => Ok(()),
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> StoreError {
    StoreError::Parse {
        line,
        message: message.into(),
    }
}

// ============================================================================
// Document model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry { key: String, value: String },
    Comment(String),
    Blank,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    name: String,
    lines: Vec<Line>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lines: Vec::new(),
        }
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|l| match l {
            Line::Entry { key: k, value } if k.eq_ignore_ascii_case(key) => Some(value.as_str()),
            _ => None,
        })
    }

    fn value_mut(&mut self, key: &str) -> Option<&mut String> {
        self.lines.iter_mut().find_map(|l| match l {
            Line::Entry { key: k, value } if k.eq_ignore_ascii_case(key) => Some(value),
            _ => None,
        })
    }
}

/// Parsed CPF, faithful enough to write back without losing comments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpfDocument {
    preamble: Vec<Line>,
    sections: Vec<Section>,
}

impl CpfDocument {
    pub fn parse(content: &str) -> Result<Self, StoreError> {
        let mut doc = Self::default();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim_end_matches('\r');
            let trimmed = line.trim();

            let parsed = if trimmed.is_empty() {
                Line::Blank
            } else if trimmed.starts_with(';') || trimmed.starts_with('#') {
                Line::Comment(line.to_string())
            } else if trimmed.starts_with('[') {
                let name = trimmed
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                    .map(str::trim)
                    .filter(|n| !n.is_empty() && !n.contains(|c| c == '[' || c == ']'))
                    .ok_or_else(|| {
                        parse_error(line_no, format!("malformed section header '{}'", trimmed))
                    })?;
                if doc.section(name).is_some() {
                    return Err(parse_error(line_no, format!("duplicate section [{}]", name)));
                }
                doc.sections.push(Section::new(name));
                continue;
            } else {
                let (key, value) = trimmed.split_once('=').ok_or_else(|| {
                    parse_error(line_no, format!("expected key=value, found '{}'", trimmed))
                })?;
                let key = key.trim();
                if key.is_empty() {
                    return Err(parse_error(line_no, "empty key"));
                }
                let section = doc.sections.last().ok_or_else(|| {
                    parse_error(line_no, format!("key '{}' appears before any section", key))
                })?;
                if section.value(key).is_some() {
                    return Err(parse_error(
                        line_no,
                        format!("duplicate key '{}' in section [{}]", key, section.name),
                    ));
                }
                Line::Entry {
                    key: key.to_string(),
                    value: value.trim().to_string(),
                }
            };

            match doc.sections.last_mut() {
                Some(section) => section.lines.push(parsed),
                None => doc.preamble.push(parsed),
            }
        }

        Ok(doc)
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?.value(key)
    }

    /// Set a value, creating the section or key as needed. Returns the old value.
    pub fn set(&mut self, section: &str, key: &str, value: &str) -> Result<Option<String>, StoreError> {
        check_entry(section, key)?;
        let index = match self.sections.iter().position(|s| s.name == section) {
            Some(index) => index,
            None => {
                let previous = match self.sections.last_mut() {
                    Some(last) => &mut last.lines,
                    None => &mut self.preamble,
                };
                if !previous.is_empty() && !matches!(previous.last(), Some(Line::Blank)) {
                    previous.push(Line::Blank);
                }
                self.sections.push(Section::new(section));
                self.sections.len() - 1
            }
        };

        let target = &mut self.sections[index];
        if let Some(existing) = target.value_mut(key) {
            return Ok(Some(std::mem::replace(existing, value.to_string())));
        }

        let insert_at = target
            .lines
            .iter()
            .rposition(|l| matches!(l, Line::Entry { .. }))
            .map(|p| p + 1)
            .unwrap_or(0);
        target.lines.insert(
            insert_at,
            Line::Entry {
                key: key.to_string(),
                value: value.to_string(),
            },
        );
        Ok(None)
    }

    pub fn section_names(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.name.as_str()).collect()
    }

    /// Every section with its key/value pairs
    pub fn to_map(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.sections
            .iter()
            .map(|s| {
                let entries = s
                    .lines
                    .iter()
                    .filter_map(|l| match l {
                        Line::Entry { key, value } => Some((key.clone(), value.clone())),
                        _ => None,
                    })
                    .collect();
                (s.name.clone(), entries)
            })
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.preamble {
            render_line(&mut out, line);
        }
        for section in &self.sections {
            out.push('[');
            out.push_str(&section.name);
            out.push_str("]\n");
            for line in &section.lines {
                render_line(&mut out, line);
            }
        }
        out
    }
}

fn render_line(out: &mut String, line: &Line) {
    match line {
        Line::Entry { key, value } => {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        Line::Comment(text) => out.push_str(text),
        Line::Blank => {}
    }
    out.push('\n');
}

// ============================================================================
// Store
// ============================================================================

/// Snapshot of the CPF taken before a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRef {
    pub path: PathBuf,
    /// Hex SHA-256 of the backup content
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

/// Progress of a write, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStage {
    Start,
    BackupTaken,
    ValueWritten,
    Validated,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub old_value: Option<String>,
    pub backup: Option<BackupRef>,
    pub stages: Vec<WriteStage>,
}

/// Transactional access to one CPF file
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    backup_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Store for `path`, with backups in a `backups` directory next to it
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup_dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(BACKUP_DIR_NAME);
        Self {
            path,
            backup_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_backup_dir(mut self, backup_dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = backup_dir.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn load(&self) -> Result<CpfDocument, StoreError> {
        let content = fs::read_to_string(&self.path).map_err(|e| StoreError::Read {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        CpfDocument::parse(&content)
    }

    /// Current value, or `None` when the section, key or file is missing
    pub fn read_setting(&self, section: &str, key: &str) -> Option<String> {
        match self.load() {
            Ok(doc) => doc.get(section, key).map(str::to_string),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read CPF setting");
                None
            }
        }
    }

    pub fn all_sections(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>, StoreError> {
        Ok(self.load()?.to_map())
    }

    /// The file exists and parses
    pub fn validate(&self) -> Result<(), StoreError> {
        self.load().map(|_| ())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Whether changing `section`/`key` only takes effect after a restart
    pub fn requires_restart(section: &str, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        RESTART_SECTIONS.contains(&section) || RESTART_KEYS.contains(&key.as_str())
    }

    /// Set one value transactionally.
    ///
    /// With `backup = false` a missing file is created from scratch; with a
    /// backup requested, a missing file aborts the write.
    pub fn write_setting(
        &self,
        section: &str,
        key: &str,
        value: &str,
        backup: bool,
    ) -> Result<WriteReceipt, StoreError> {
        check_entry(section, key)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut stages = vec![WriteStage::Start];

        let backup_ref = if backup {
            match self.create_backup() {
                Ok(b) => {
                    stages.push(WriteStage::BackupTaken);
                    Some(b)
                }
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "Aborting CPF write, backup failed");
                    return Err(e);
                }
            }
        } else {
            None
        };

        let old_value = match self.apply(section, key, value) {
            Ok(old) => old,
            Err(reason) => {
                error!(section, key, error = %reason, "CPF write failed");
                let rolled_back = self.rollback(backup_ref.as_ref());
                return Err(StoreError::WriteFailed {
                    reason,
                    backup: backup_ref,
                    rolled_back,
                });
            }
        };
        stages.push(WriteStage::ValueWritten);

        if let Err(e) = self.validate() {
            error!(section, key, error = %e, "CPF invalid after write");
            let rolled_back = self.rollback(backup_ref.as_ref());
            return Err(StoreError::ValidationFailed {
                reason: e.to_string(),
                backup: backup_ref,
                rolled_back,
            });
        }
        stages.push(WriteStage::Validated);
        stages.push(WriteStage::Success);

        info!(
            path = %self.path.display(),
            section,
            key,
            old_value = old_value.as_deref().unwrap_or("<unset>"),
            new_value = value,
            "CPF setting written"
        );

        Ok(WriteReceipt {
            old_value,
            backup: backup_ref,
            stages,
        })
    }

    fn apply(&self, section: &str, key: &str, value: &str) -> Result<Option<String>, String> {
        let mut doc = match fs::read_to_string(&self.path) {
            Ok(content) => CpfDocument::parse(&content).map_err(|e| e.to_string())?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => CpfDocument::default(),
            Err(e) => return Err(format!("cannot read {}: {}", self.path.display(), e)),
        };
        let old = doc.set(section, key, value).map_err(|e| e.to_string())?;
        persist_atomic(&self.path, doc.render().as_bytes())
            .map_err(|e| format!("cannot persist {}: {}", self.path.display(), e))?;
        Ok(old)
    }

    fn rollback(&self, backup: Option<&BackupRef>) -> bool {
        let Some(backup) = backup else {
            return false;
        };
        match self.restore_backup(backup) {
            Ok(()) => {
                warn!(backup = %backup.path.display(), "CPF restored from backup");
                true
            }
            Err(e) => {
                error!(backup = %backup.path.display(), error = %e, "CPF rollback failed");
                false
            }
        }
    }

    /// Copy the live file to a new, uniquely named backup
    pub fn create_backup(&self) -> Result<BackupRef, StoreError> {
        let content = fs::read(&self.path).map_err(|e| {
            StoreError::BackupFailed(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        fs::create_dir_all(&self.backup_dir).map_err(|e| {
            StoreError::BackupFailed(format!(
                "cannot create {}: {}",
                self.backup_dir.display(),
                e
            ))
        })?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "iris.cpf".to_string());
        let base = format!(
            "{}.backup.{}",
            file_name,
            Local::now().format(BACKUP_TIMESTAMP_FORMAT)
        );

        let (backup_path, mut file) = self.open_unique(&base)?;
        file.write_all(&content)
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                let _ = fs::remove_file(&backup_path);
                StoreError::BackupFailed(format!("cannot write {}: {}", backup_path.display(), e))
            })?;

        let backup = BackupRef {
            path: backup_path,
            sha256: sha256_hex(&content),
            created_at: Utc::now(),
        };
        debug!(backup = %backup.path.display(), sha256 = %backup.sha256, "CPF backup created");
        Ok(backup)
    }

    fn open_unique(&self, base: &str) -> Result<(PathBuf, File), StoreError> {
        for n in 0..MAX_BACKUP_SUFFIX {
            let name = if n == 0 {
                base.to_string()
            } else {
                format!("{}-{}", base, n)
            };
            let candidate = self.backup_dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => return Ok((candidate, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(StoreError::BackupFailed(format!(
                        "cannot create {}: {}",
                        candidate.display(),
                        e
                    )))
                }
            }
        }
        Err(StoreError::BackupFailed(format!(
            "too many backups named {} in {}",
            base,
            self.backup_dir.display()
        )))
    }

    /// Overwrite the live file with a backup after checking its checksum.
    /// Restoring the same backup twice leaves the same content.
    pub fn restore_backup(&self, backup: &BackupRef) -> Result<(), StoreError> {
        let restore_failed = |reason: String| StoreError::RestoreFailed {
            path: backup.path.clone(),
            reason,
        };

        let content = fs::read(&backup.path).map_err(|e| restore_failed(e.to_string()))?;
        let actual = sha256_hex(&content);
        if actual != backup.sha256 {
            return Err(restore_failed(format!(
                "checksum mismatch (expected {}, found {})",
                backup.sha256, actual
            )));
        }

        persist_atomic(&self.path, &content).map_err(|e| restore_failed(e.to_string()))
    }
}

pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `contents` via a synced temp file in the same directory
fn persist_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cpf".to_string());
    let tmp = dir.join(format!(
        ".{}.tmp-{}-{}",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(&tmp, meta.permissions())?;
        }
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "; IRIS configuration\n\
[ConfigFile]\n\
Version=2024.1\n\
\n\
[Startup]\n\
# memory settings\n\
Globals=10000\n\
routines=64\n\
\n\
[Journal]\n\
CurrentDirectory=/usr/irissys/mgr/journal/\n";

    fn store_with(content: &str) -> (TempDir, ConfigStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("iris.cpf");
        fs::write(&path, content).unwrap();
        let store = ConfigStore::new(&path);
        (dir, store)
    }

    #[test]
    fn test_parse_render_preserves_layout() {
        let doc = CpfDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.render(), SAMPLE);
        assert_eq!(doc.section_names(), vec!["ConfigFile", "Startup", "Journal"]);
    }

    #[test]
    fn test_key_lookup_is_case_insensitive() {
        let doc = CpfDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.get("Startup", "globals"), Some("10000"));
        assert_eq!(doc.get("Startup", "ROUTINES"), Some("64"));
        assert_eq!(doc.get("startup", "globals"), None);
        assert_eq!(doc.get("Startup", "missing"), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            CpfDocument::parse("orphan=1\n"),
            Err(StoreError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            CpfDocument::parse("[A]\nx=1\n[A]\n"),
            Err(StoreError::Parse { line: 3, .. })
        ));
        assert!(matches!(
            CpfDocument::parse("[A]\njust some words\n"),
            Err(StoreError::Parse { line: 2, .. })
        ));
        assert!(matches!(
            CpfDocument::parse("[A]\nx=1\nX=2\n"),
            Err(StoreError::Parse { line: 3, .. })
        ));
        assert!(CpfDocument::parse("[A\n").is_err());
    }

    #[test]
    fn test_set_keeps_original_key_spelling() {
        let mut doc = CpfDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.set("Startup", "globals", "20000").unwrap(), Some("10000".to_string()));
        assert!(doc.render().contains("Globals=20000\n"));
    }

    #[test]
    fn test_set_creates_section_and_key() {
        let mut doc = CpfDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.set("Startup", "gmheap", "37568").unwrap(), None);
        assert_eq!(doc.set("Miscellaneous", "EnableLongStrings", "1").unwrap(), None);

        let rendered = doc.render();
        let reparsed = CpfDocument::parse(&rendered).unwrap();
        assert_eq!(reparsed.get("Startup", "gmheap"), Some("37568"));
        assert_eq!(reparsed.get("Miscellaneous", "EnableLongStrings"), Some("1"));
        // New key lands after the last existing entry, before the blank separator
        assert!(rendered.contains("routines=64\ngmheap=37568\n\n[Journal]"));
    }

    #[test]
    fn test_set_rejects_names_that_do_not_read_back() {
        let mut doc = CpfDocument::parse(SAMPLE).unwrap();
        let before = doc.render();
        for (section, key) in [
            ("Miscellaneous", "a=b"),
            ("Miscellaneous", "#note"),
            ("Miscellaneous", ";note"),
            ("Miscellaneous", "[Other]"),
            ("Miscellaneous", " padded"),
            ("Miscellaneous", "two\nlines"),
            ("Misc]ellaneous", "key"),
            ("[Startup", "key"),
            (" Startup", "key"),
            ("Start\rup", "key"),
        ] {
            let err = doc.set(section, key, "42").unwrap_err();
            assert!(matches!(err, StoreError::InvalidEntry(_)), "{:?} {:?}", section, key);
        }
        assert_eq!(doc.render(), before);
    }

    #[test]
    fn test_write_setting_with_bad_key_touches_nothing() {
        let (_dir, store) = store_with(SAMPLE);

        let err = store.write_setting("Miscellaneous", "a=b", "42", true).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntry(_)));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), SAMPLE);
        assert!(!store.backup_dir().exists());
    }

    #[test]
    fn test_write_setting_backs_up_and_returns_old_value() {
        let (_dir, store) = store_with(SAMPLE);

        let receipt = store.write_setting("Startup", "globals", "20000", true).unwrap();
        assert_eq!(receipt.old_value.as_deref(), Some("10000"));
        assert_eq!(
            receipt.stages,
            vec![
                WriteStage::Start,
                WriteStage::BackupTaken,
                WriteStage::ValueWritten,
                WriteStage::Validated,
                WriteStage::Success,
            ]
        );

        let backup = receipt.backup.unwrap();
        assert!(backup.path.starts_with(store.backup_dir()));
        let name = backup.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("iris.cpf.backup."), "{}", name);
        assert_eq!(fs::read_to_string(&backup.path).unwrap(), SAMPLE);
        assert_eq!(backup.sha256, sha256_hex(SAMPLE.as_bytes()));

        assert_eq!(store.read_setting("Startup", "globals").as_deref(), Some("20000"));
        assert_eq!(store.read_setting("Journal", "CurrentDirectory").as_deref(), Some("/usr/irissys/mgr/journal/"));
    }

    #[test]
    fn test_backups_in_same_second_do_not_collide() {
        let (_dir, store) = store_with(SAMPLE);
        let a = store.create_backup().unwrap();
        let b = store.create_backup().unwrap();
        let c = store.create_backup().unwrap();
        assert_ne!(a.path, b.path);
        assert_ne!(b.path, c.path);
        assert_ne!(a.path, c.path);
    }

    #[test]
    fn test_invalid_write_is_rolled_back() {
        let (_dir, store) = store_with(SAMPLE);

        let err = store
            .write_setting("Startup", "globals", "20000\nthis line is garbage", true)
            .unwrap_err();
        assert!(matches!(err, StoreError::ValidationFailed { rolled_back: true, .. }));
        assert!(err.backup().is_some());

        assert_eq!(fs::read_to_string(store.path()).unwrap(), SAMPLE);
        assert_eq!(store.read_setting("Startup", "globals").as_deref(), Some("10000"));
    }

    #[test]
    fn test_missing_file_with_backup_aborts_without_creating() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("iris.cpf"));

        let err = store.write_setting("Startup", "globals", "1", true).unwrap_err();
        assert!(matches!(err, StoreError::BackupFailed(_)));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_missing_file_without_backup_is_created() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("iris.cpf"));

        let receipt = store.write_setting("Startup", "globals", "1", false).unwrap();
        assert!(receipt.old_value.is_none());
        assert!(receipt.backup.is_none());
        assert_eq!(store.read_setting("Startup", "globals").as_deref(), Some("1"));
    }

    #[test]
    fn test_restore_rejects_tampered_backup() {
        let (_dir, store) = store_with(SAMPLE);
        let backup = store.create_backup().unwrap();
        fs::write(&backup.path, "[Startup]\nglobals=1\n").unwrap();

        let err = store.restore_backup(&backup).unwrap_err();
        assert!(matches!(err, StoreError::RestoreFailed { .. }));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), SAMPLE);
    }

    #[test]
    fn test_restore_is_idempotent() {
        let (_dir, store) = store_with(SAMPLE);
        let backup = store.create_backup().unwrap();
        store.write_setting("Startup", "globals", "1", false).unwrap();

        store.restore_backup(&backup).unwrap();
        store.restore_backup(&backup).unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), SAMPLE);
    }

    #[test]
    fn test_requires_restart_table() {
        assert!(ConfigStore::requires_restart("Startup", "anything"));
        assert!(ConfigStore::requires_restart("config", "anything"));
        assert!(ConfigStore::requires_restart("Misc", "GLOBALS"));
        assert!(ConfigStore::requires_restart("Misc", "wijdir"));
        assert!(!ConfigStore::requires_restart("Misc", "EnableLongStrings"));
        assert!(!ConfigStore::requires_restart("startup", "x"));
    }

    #[test]
    fn test_all_sections() {
        let (_dir, store) = store_with(SAMPLE);
        let sections = store.all_sections().unwrap();
        assert_eq!(sections.len(), 3);
        assert_eq!(sections["Startup"]["Globals"], "10000");
        assert!(store.is_valid());
    }

    #[test]
    fn test_read_setting_on_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("absent.cpf"));
        assert_eq!(store.read_setting("Startup", "globals"), None);
        assert!(!store.is_valid());
    }
}
