//! IRIS `messages.log` entries
//!
//! Line format, bit-exact:
//!
//! ```text
//! MM/DD/YY-HH:MM:SS:mmm (PID) SEVERITY [Category.Subcategory] Message text
//! 11/14/25-09:45:57:762 (50803) 2 [Generic.Event] Kerberos authentication unavailable
//! ```
//!
//! `ErrorMessage` is always valid: construction and deserialization both run
//! the same checks. `LogParser` extracts entries from real log files so the
//! generator can show the advisor what genuine messages look like.
//! `ErrorGenerator` asks the advisor for a new message and falls back to
//! fixed templates whenever the advisor is missing or produces garbage.

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::advisor::{call_with_retry, Advisor, AdvisorError, RetryPolicy};

pub const MIN_MESSAGE_LEN: usize = 10;
pub const MAX_MESSAGE_LEN: usize = 500;
pub const MAX_PROCESS_ID: u32 = 999_999;

const TIMESTAMP_FORMAT: &str = "%m/%d/%y-%H:%M:%S:%3f";

static TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{2})/(\d{2})/(\d{2})-(\d{2}):(\d{2}):(\d{2}):(\d{3})$").expect("timestamp pattern")
});

static CATEGORY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[[\w.]+\]$").expect("category pattern"));

static LOG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(\d{2}/\d{2}/\d{2}-\d{2}:\d{2}:\d{2}:\d{3})\s+",
        r"\((\d+)\)\s+",
        r"(\d)\s+",
        r"(\[[\w.]+\])\s+",
        r"(.+)$",
    ))
    .expect("log line pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorLogError {
    #[error("invalid timestamp '{0}', expected MM/DD/YY-HH:MM:SS:mmm")]
    Timestamp(String),

    #[error("process id {0} out of range 1-999999")]
    ProcessId(u32),

    #[error("severity {0} out of range 0-3")]
    Severity(u8),

    #[error("invalid category tag '{0}', expected [Category.Subcategory]")]
    Category(String),

    #[error("message text must be 10-500 characters, got {0}")]
    MessageLength(usize),

    #[error("message text must be a single line without control characters")]
    ControlCharacter,

    #[error("unknown error category '{0}' (expected license, config, os, journal or other)")]
    UnknownCategory(String),
}

// ============================================================================
// Severity and categories
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Severity {
    Info = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

impl Severity {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Info => "Informational (0) - normal operations, successful completions",
            Self::Warning => "Warning (1) - potential issues that don't prevent operation",
            Self::Error => "Error (2) - failures that impact functionality",
            Self::Fatal => "Fatal (3) - critical failures that prevent system operation",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::Error
    }
}

impl TryFrom<u8> for Severity {
    type Error = ErrorLogError;

    fn try_from(value: u8) -> Result<Severity, ErrorLogError> {
        match value {
            0 => Ok(Severity::Info),
            1 => Ok(Severity::Warning),
            2 => Ok(Severity::Error),
            3 => Ok(Severity::Fatal),
            other => Err(ErrorLogError::Severity(other)),
        }
    }
}

impl From<Severity> for u8 {
    fn from(severity: Severity) -> u8 {
        severity.as_u8()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Kind of problem a message describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    License,
    Config,
    Os,
    Journal,
    Other,
}

const LICENSE_TEMPLATES: [&str; 3] = [
    "LMF Error: No valid license key. No valid local file found.",
    "License expiration in 30 days. Renew license to avoid service interruption.",
    "License validation failed: key signature mismatch",
];

const CONFIG_TEMPLATES: [&str; 3] = [
    "Configuration parameter 'globals' value exceeds recommended maximum",
    "CPF file parsing error in section [Startup]",
    "Invalid configuration: routine buffer size must be positive integer",
];

const OS_TEMPLATES: [&str; 3] = [
    "Shared memory allocation failed: insufficient system resources",
    "Global buffer setting may be too low for optimal performance",
    "Insufficient shared memory for requested global buffers",
];

const JOURNAL_TEMPLATES: [&str; 3] = [
    "Journal write-image file lock failed, permission denied",
    "Journal directory space low, 10% remaining",
    "WIJ file corruption detected, recovery required",
];

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        Self::License,
        Self::Config,
        Self::Os,
        Self::Journal,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::License => "license",
            Self::Config => "config",
            Self::Os => "os",
            Self::Journal => "journal",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ErrorLogError> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ErrorLogError::UnknownCategory(s.to_string()))
    }

    /// Category tag written into generated lines
    pub fn tag(&self) -> &'static str {
        match self {
            Self::License => "[Utility.Event]",
            Self::Config => "[config]",
            Self::Os => "[Database]",
            Self::Journal => "[WriteDaemon]",
            Self::Other => "[Generic.Event]",
        }
    }

    /// Fallback message texts. Uncategorised messages reuse the config set.
    pub fn templates(&self) -> &'static [&'static str] {
        match self {
            Self::License => &LICENSE_TEMPLATES,
            Self::Config | Self::Other => &CONFIG_TEMPLATES,
            Self::Os => &OS_TEMPLATES,
            Self::Journal => &JOURNAL_TEMPLATES,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::License => "License Management Facility (LMF) errors - missing keys, expiration, validation failures",
            Self::Config => "Configuration parameter errors - CPF file issues, invalid settings, startup problems",
            Self::Os => "Operating system resource errors - memory allocation, shared memory, CPU constraints",
            Self::Journal => "Journal system errors - Write-Image Journal (WIJ) issues, locking, directory permissions",
            Self::Other => "General error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawErrorMessage")]
pub struct ErrorMessage {
    timestamp: String,
    process_id: u32,
    severity: Severity,
    category: String,
    message_text: String,
}

#[derive(Deserialize)]
struct RawErrorMessage {
    timestamp: String,
    process_id: u32,
    severity: Severity,
    category: String,
    message_text: String,
}

impl TryFrom<RawErrorMessage> for ErrorMessage {
    type Error = ErrorLogError;

    fn try_from(raw: RawErrorMessage) -> Result<Self, ErrorLogError> {
        Self::new(raw.timestamp, raw.process_id, raw.severity, raw.category, raw.message_text)
    }
}

impl ErrorMessage {
    pub fn new(
        timestamp: impl Into<String>,
        process_id: u32,
        severity: Severity,
        category: impl Into<String>,
        message_text: impl Into<String>,
    ) -> Result<Self, ErrorLogError> {
        let message = Self {
            timestamp: timestamp.into(),
            process_id,
            severity,
            category: category.into(),
            message_text: message_text.into(),
        };
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), ErrorLogError> {
        validate_timestamp(&self.timestamp)?;
        if !(1..=MAX_PROCESS_ID).contains(&self.process_id) {
            return Err(ErrorLogError::ProcessId(self.process_id));
        }
        if !CATEGORY_TAG.is_match(&self.category) {
            return Err(ErrorLogError::Category(self.category.clone()));
        }
        let length = self.message_text.chars().count();
        if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&length) {
            return Err(ErrorLogError::MessageLength(length));
        }
        if self.message_text.chars().any(char::is_control) {
            return Err(ErrorLogError::ControlCharacter);
        }
        Ok(())
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn message_text(&self) -> &str {
        &self.message_text
    }

    pub fn to_log_format(&self) -> String {
        format!(
            "{} ({}) {} {} {}",
            self.timestamp, self.process_id, self.severity, self.category, self.message_text
        )
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_log_format())
    }
}

/// Render a time in log timestamp format
pub fn format_timestamp<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    time.format(TIMESTAMP_FORMAT).to_string()
}

fn validate_timestamp(timestamp: &str) -> Result<(), ErrorLogError> {
    let invalid = || ErrorLogError::Timestamp(timestamp.to_string());
    let caps = TIMESTAMP.captures(timestamp).ok_or_else(invalid)?;
    let field = |i: usize| caps[i].parse::<u32>().map_err(|_| invalid());

    let (month, day, year) = (field(1)?, field(2)?, field(3)?);
    NaiveDate::from_ymd_opt(2000 + year as i32, month, day).ok_or_else(invalid)?;
    NaiveTime::from_hms_milli_opt(field(4)?, field(5)?, field(6)?, field(7)?).ok_or_else(invalid)?;
    Ok(())
}

// ============================================================================
// Parser
// ============================================================================

/// Entries of one or more log files grouped by category
#[derive(Debug, Clone, Default)]
pub struct LogParser {
    patterns: BTreeMap<ErrorCategory, Vec<ErrorMessage>>,
    total_entries: usize,
}

impl LogParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser loaded from `path`; a missing or unreadable file gives an empty parser
    pub fn from_file(path: &Path) -> Self {
        let mut parser = Self::new();
        if let Err(e) = parser.load_file(path) {
            warn!(path = %path.display(), error = %e, "Cannot read log samples");
        }
        parser
    }

    /// Parse one line; `None` when it is not a valid entry
    pub fn parse_line(line: &str) -> Option<ErrorMessage> {
        let caps = LOG_LINE.captures(line.trim())?;
        let process_id = caps[2].parse().ok()?;
        let severity = caps[3].parse::<u8>().ok().and_then(|s| Severity::try_from(s).ok())?;

        match ErrorMessage::new(&caps[1], process_id, severity, &caps[4], caps[5].trim()) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(line = %truncate(line, 100), error = %e, "Skipping invalid log line");
                None
            }
        }
    }

    /// Keyword categorisation; the first matching group wins
    pub fn categorize(message: &ErrorMessage) -> ErrorCategory {
        const GROUPS: [(ErrorCategory, &[&str]); 4] = [
            (ErrorCategory::License, &["license", "lmf", "key"]),
            (
                ErrorCategory::Config,
                &["config", "parameter", "startup", "globals", "routines", "cpf"],
            ),
            (
                ErrorCategory::Os,
                &["memory", "allocation", "shared memory", "buffer", "cpu", "resource"],
            ),
            (ErrorCategory::Journal, &["journal", "wij", "write-image", "lock"]),
        ];

        let text = message.message_text().to_lowercase();
        GROUPS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::Other)
    }

    /// Add every valid line of `path`. A missing file adds nothing.
    pub fn load_file(&mut self, path: &Path) -> io::Result<usize> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Log sample file not found, no examples loaded");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let added = self.load_str(&String::from_utf8_lossy(&bytes));
        info!(
            path = %path.display(),
            added,
            total = self.total_entries,
            categories = ?self.categories(),
            "Log samples parsed"
        );
        Ok(added)
    }

    pub fn load_str(&mut self, content: &str) -> usize {
        let mut added = 0;
        for message in content.lines().filter(|l| !l.trim().is_empty()).filter_map(Self::parse_line) {
            let category = Self::categorize(&message);
            self.patterns.entry(category).or_default().push(message);
            added += 1;
        }
        self.total_entries += added;
        added
    }

    /// Up to `count` examples of a category, in file order
    pub fn examples(&self, category: ErrorCategory, count: usize) -> &[ErrorMessage] {
        self.patterns
            .get(&category)
            .map(|entries| &entries[..count.min(entries.len())])
            .unwrap_or(&[])
    }

    pub fn categories(&self) -> Vec<ErrorCategory> {
        self.patterns.keys().copied().collect()
    }

    pub fn total_entries(&self) -> usize {
        self.total_entries
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ============================================================================
// Generator
// ============================================================================

const GENERATION_SYSTEM_PROMPT: &str = "You are an InterSystems IRIS database expert producing \
realistic messages.log entries for testing monitoring and remediation tooling. Use accurate IRIS \
terminology and keep each message to one line.";

const GENERATION_SCHEMA: &str = r#"{
  "timestamp": "MM/DD/YY-HH:MM:SS:mmm",
  "process_id": 1-999999,
  "severity": 0 | 1 | 2 | 3,
  "category": "[Category.Subcategory]",
  "message_text": "10-500 characters"
}"#;

/// How a message was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationSource {
    Advisor,
    Template,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedError {
    pub message: ErrorMessage,
    pub source: GenerationSource,
}

/// Produces synthetic error messages for a category and severity
pub struct ErrorGenerator {
    advisor: Option<Arc<dyn Advisor>>,
    retry: RetryPolicy,
    samples: LogParser,
}

impl ErrorGenerator {
    /// Template-only generator
    pub fn new(samples: LogParser) -> Self {
        Self {
            advisor: None,
            retry: RetryPolicy::default(),
            samples,
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn Advisor>, retry: RetryPolicy) -> Self {
        self.advisor = Some(advisor);
        self.retry = retry;
        self
    }

    pub fn samples(&self) -> &LogParser {
        &self.samples
    }

    pub fn generate(&self, category: ErrorCategory, severity: Severity, context: &str) -> GeneratedError {
        info!(category = %category, severity = %severity, "Generating error message");

        if let Some(advisor) = self.advisor.as_deref() {
            match self.generate_with_advisor(advisor, category, severity, context) {
                Ok(message) => {
                    return GeneratedError {
                        message,
                        source: GenerationSource::Advisor,
                    }
                }
                Err(e) => warn!(error = %e, "Advisor generation failed, using template"),
            }
        }

        GeneratedError {
            message: Self::from_template(category, severity),
            source: GenerationSource::Template,
        }
    }

    /// Random template message stamped with the current local time
    pub fn from_template(category: ErrorCategory, severity: Severity) -> ErrorMessage {
        let mut rng = rand::thread_rng();
        let templates = category.templates();
        let text = templates[rng.gen_range(0..templates.len())];

        // Templates and tags are fixed and known valid
        ErrorMessage {
            timestamp: format_timestamp(&Local::now()),
            process_id: rng.gen_range(10_000..=99_999),
            severity,
            category: category.tag().to_string(),
            message_text: text.to_string(),
        }
    }

    fn generate_with_advisor(
        &self,
        advisor: &dyn Advisor,
        category: ErrorCategory,
        severity: Severity,
        context: &str,
    ) -> Result<ErrorMessage, AdvisorError> {
        let prompt = self.prompt(category, severity, context);
        call_with_retry(
            advisor,
            &self.retry,
            "generate_error",
            (GENERATION_SYSTEM_PROMPT, prompt.as_str(), GENERATION_SCHEMA),
            |value: Value| {
                let message: ErrorMessage = serde_json::from_value(value)
                    .map_err(|e| AdvisorError::Rejected(format!("generated message: {}", e)))?;
                if message.severity() != severity {
                    return Err(AdvisorError::Rejected(format!(
                        "generated severity {} but {} was requested",
                        message.severity(),
                        severity
                    )));
                }
                Ok(message)
            },
        )
    }

    fn prompt(&self, category: ErrorCategory, severity: Severity, context: &str) -> String {
        let mut prompt = format!(
            "Generate a realistic InterSystems IRIS database error message.\n\n\
             Error Category: {}\nDescription: {}\n\n\
             Severity Level: {}\nDescription: {}\n",
            category,
            category.description(),
            severity,
            severity.description()
        );
        if !context.trim().is_empty() {
            prompt.push_str(&format!("\nContext: {}\n", context.trim()));
        }

        let examples = self.samples.examples(category, 3);
        if !examples.is_empty() {
            prompt.push_str("\nExample IRIS error messages from actual logs:\n");
            for example in examples {
                prompt.push_str(&format!("- {}\n", example.to_log_format()));
            }
        }

        prompt.push_str(&format!(
            "\nRequirements:\n\
             1. Match IRIS messages.log format exactly\n\
             2. Use realistic technical terminology for IRIS systems\n\
             3. Timestamp format: MM/DD/YY-HH:MM:SS:mmm (use the current date, {})\n\
             4. Process ID: random 5-6 digit number\n\
             5. Category tag: appropriate [Category.Subcategory] format\n\
             6. Message text: technically accurate, 10-100 words\n\n\
             Generate ONE error message that matches the specified category and severity.",
            Local::now().format("%m/%d/%y")
        ));
        prompt
    }
}
