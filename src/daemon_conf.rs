//! Line-preserving reader/rewriter for the daemon's `deeprotection.conf`.
//!
//! The file is plain text: `#` comments, `key=value` basic settings and two
//! list sections introduced by a header line containing a marker token.
//! Reads build a [`ConfigDocument`] view; writes patch the raw lines in place
//! so anything the view does not model survives untouched.

use serde::Serialize;
use serde_json::Value;
use std::{borrow::Cow, collections::BTreeMap, fmt, fs, io, path::{Path, PathBuf}, sync::OnceLock};
use thiserror::Error;
use time::{macros::format_description, OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

pub const BASIC_KEYS: [&str; 8] = [
    "language", "disable", "expire_hours", "timestamp", "update", "mode", "web_ip", "web_port",
];

#[derive(Debug, Error)]
pub enum ConfStoreError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to create backup {path}: {source}")]
    Backup { path: PathBuf, source: io::Error },
    #[error("invalid patch: {0}")]
    BadPatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    ProtectedPaths,
    CommandRules,
}

impl Section {
    /// Scan order for header detection and patch application.
    pub const ALL: [Section; 2] = [Section::ProtectedPaths, Section::CommandRules];

    pub fn marker(self) -> &'static str {
        match self {
            Section::ProtectedPaths => "protected_paths_list",
            Section::CommandRules => "command_intercept_rules",
        }
    }

    /// Field name used for this section in the JSON document and patches.
    pub fn field(self) -> &'static str {
        match self {
            Section::ProtectedPaths => "protected_paths",
            Section::CommandRules => "command_rules",
        }
    }

    /// First section whose marker appears anywhere in `line`.
    pub fn detect(line: &str) -> Option<Section> {
        Section::ALL.into_iter().find(|s| line.contains(s.marker()))
    }

    fn from_field(field: &str) -> Option<Section> {
        Section::ALL.into_iter().find(|s| s.field() == field)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Structured view over the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigDocument {
    pub basic: BTreeMap<String, String>,
    pub protected_paths: Vec<String>,
    pub command_rules: Vec<String>,
}

impl ConfigDocument {
    fn section_mut(&mut self, section: Section) -> &mut Vec<String> {
        match section {
            Section::ProtectedPaths => &mut self.protected_paths,
            Section::CommandRules => &mut self.command_rules,
        }
    }

    /// Remaining disable window, only when protection is switched off.
    pub fn disable_remaining(&self, now: OffsetDateTime) -> Option<Remaining> {
        match self.basic.get("disable").map(String::as_str) {
            Some("true") => Some(remaining_disable_period(&self.basic, now)),
            _ => None,
        }
    }
}

/// Non-fatal problem found while parsing or patching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    MalformedLine { line: usize },
    UnknownSection { section: Section },
    UnknownKey { key: String },
    SkippedBasicValue { key: String },
    SkippedListItem { section: Section, index: usize },
    IgnoredField { field: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::MalformedLine { line } => write!(f, "line {line}: setting without a key"),
            Warning::UnknownSection { section } => {
                write!(f, "section {section} not found in config file; skipped")
            }
            Warning::UnknownKey { key } => write!(f, "basic setting {key:?} is not recognised; skipped"),
            Warning::SkippedBasicValue { key } => write!(f, "value for {key:?} is not a scalar; skipped"),
            Warning::SkippedListItem { section, index } => {
                write!(f, "{section}[{index}] is not a string; skipped")
            }
            Warning::IgnoredField { field } => write!(f, "patch field {field:?} ignored"),
        }
    }
}

/// A successful result together with the warnings collected on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<Warning>,
}

impl<T> Outcome<T> {
    fn new(value: T, warnings: Vec<Warning>) -> Self {
        Self { value, warnings }
    }
}

/// `key=value` split of a non-blank, non-comment line, both sides trimmed.
pub(crate) fn setting_of(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (key, value) = trimmed.split_once('=')?;
    Some((key.trim(), value.trim()))
}

/// Single pass over the file contents. Bytes that are not UTF-8 are read
/// lossily, line by line, and never stop the parse.
pub fn parse(bytes: impl AsRef<[u8]>) -> Outcome<ConfigDocument> {
    let mut doc = ConfigDocument::default();
    let mut warnings = Vec::new();
    let mut current: Option<Section> = None;

    for (idx, raw) in bytes.as_ref().split(|b| *b == b'\n').enumerate() {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = String::from_utf8_lossy(raw);
        let line: &str = &text;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(section) = Section::detect(trimmed) {
            current = Some(section);
            continue;
        }
        if let Some((key, value)) = setting_of(line) {
            if key.is_empty() {
                warnings.push(Warning::MalformedLine { line: idx + 1 });
            } else if BASIC_KEYS.contains(&key) {
                doc.basic.insert(key.to_string(), value.to_string());
            }
            continue;
        }
        if trimmed.starts_with('#') {
            continue;
        }
        if let Some(section) = current {
            doc.section_mut(section).push(line.to_string());
        }
    }
    Outcome::new(doc, warnings)
}

/// The file as an ordered list of lines, without their `\n` terminators.
/// Lines stay raw bytes so anything a patch does not touch is written back
/// exactly as read, valid UTF-8 or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLines(Vec<Vec<u8>>);

impl RawLines {
    pub fn split(bytes: &[u8]) -> Self {
        let mut lines: Vec<Vec<u8>> = bytes.split(|b| *b == b'\n').map(<[u8]>::to_vec).collect();
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        Self(lines)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Text view of each line; invalid sequences show as U+FFFD.
    pub fn lines(&self) -> impl Iterator<Item = Cow<'_, str>> {
        self.0.iter().map(|l| String::from_utf8_lossy(l))
    }

    /// Joined lines, always terminated by exactly one newline.
    pub fn render(&self) -> Vec<u8> {
        let mut out = self.0.join(&b'\n');
        out.push(b'\n');
        out
    }

    fn replace_section(&mut self, section: Section, items: &[String]) -> bool {
        let Some(start) = self.lines().position(|l| l.contains(section.marker())) else {
            return false;
        };
        let end = self
            .lines()
            .skip(start + 1)
            .position(|l| Section::detect(&l).is_some())
            .map_or(self.0.len(), |i| start + 1 + i);
        self.0.splice(start + 1..end, items.iter().map(|s| s.as_bytes().to_vec()));
        true
    }
}

/// Partial update: basic settings are merged, sections are replaced whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPatch {
    pub basic: BTreeMap<String, String>,
    pub protected_paths: Option<Vec<String>>,
    pub command_rules: Option<Vec<String>>,
}

impl ConfigPatch {
    /// Lenient conversion from a request body. Only a non-object body is an
    /// error; badly shaped members are dropped with a warning.
    pub fn from_json(body: &Value) -> Result<Outcome<Self>, ConfStoreError> {
        let obj = body
            .as_object()
            .ok_or_else(|| ConfStoreError::BadPatch("expected a JSON object".to_string()))?;
        let mut patch = ConfigPatch::default();
        let mut warnings = Vec::new();

        for (field, value) in obj {
            if value.is_null() {
                continue;
            }
            if field == "basic" {
                let Some(map) = value.as_object() else {
                    warnings.push(Warning::IgnoredField { field: field.clone() });
                    continue;
                };
                for (key, v) in map {
                    if !BASIC_KEYS.contains(&key.as_str()) {
                        warnings.push(Warning::UnknownKey { key: key.clone() });
                        continue;
                    }
                    match scalar_text(v) {
                        Some(text) => {
                            patch.basic.insert(key.clone(), text);
                        }
                        None => warnings.push(Warning::SkippedBasicValue { key: key.clone() }),
                    }
                }
            } else if let Some(section) = Section::from_field(field) {
                let Some(items) = value.as_array() else {
                    warnings.push(Warning::IgnoredField { field: field.clone() });
                    continue;
                };
                let mut kept = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    match item.as_str() {
                        Some(s) => kept.push(s.to_string()),
                        None => warnings.push(Warning::SkippedListItem { section, index }),
                    }
                }
                *patch.section_mut(section) = Some(kept);
            } else {
                warnings.push(Warning::IgnoredField { field: field.clone() });
            }
        }
        Ok(Outcome::new(patch, warnings))
    }

    pub fn section(&self, section: Section) -> Option<&[String]> {
        match section {
            Section::ProtectedPaths => self.protected_paths.as_deref(),
            Section::CommandRules => self.command_rules.as_deref(),
        }
    }

    fn section_mut(&mut self, section: Section) -> &mut Option<Vec<String>> {
        match section {
            Section::ProtectedPaths => &mut self.protected_paths,
            Section::CommandRules => &mut self.command_rules,
        }
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Applies `patch` to `raw`: matching `key=value` lines are rewritten in
/// place, then each patched section's body is swapped for the new items.
pub fn apply_patch(raw: RawLines, patch: &ConfigPatch) -> Outcome<RawLines> {
    let mut raw = raw;
    let mut warnings = Vec::new();

    if !patch.basic.is_empty() {
        for line in raw.0.iter_mut() {
            let replacement = setting_of(&String::from_utf8_lossy(line))
                .and_then(|(key, _)| patch.basic.get(key).map(|v| format!("{key}={v}")));
            if let Some(r) = replacement {
                *line = r.into_bytes();
            }
        }
    }

    for section in Section::ALL {
        if let Some(items) = patch.section(section) {
            if !raw.replace_section(section, items) {
                warnings.push(Warning::UnknownSection { section });
            }
        }
    }
    Outcome::new(raw, warnings)
}

/// Handle on the daemon's configuration file. Holds no cached state: every
/// call goes back to disk.
#[derive(Debug, Clone)]
pub struct ConfStore {
    path: PathBuf,
}

impl ConfStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>, ConfStoreError> {
        fs::read(&self.path)
            .map_err(|source| ConfStoreError::Read { path: self.path.clone(), source })
    }

    pub fn load(&self) -> Result<Outcome<ConfigDocument>, ConfStoreError> {
        let outcome = parse(self.read_bytes()?);
        for w in &outcome.warnings {
            debug!("{}: {}", self.path.display(), w);
        }
        Ok(outcome)
    }

    /// Backs the file up, then rewrites it with `patch` applied. Returns the
    /// backup path. Nothing is written if the backup cannot be made.
    pub fn update(&self, patch: &ConfigPatch) -> Result<Outcome<PathBuf>, ConfStoreError> {
        self.update_at(patch, now_local())
    }

    /// [`ConfStore::update`] with the backup stamped at `at`.
    pub fn update_at(&self, patch: &ConfigPatch, at: OffsetDateTime) -> Result<Outcome<PathBuf>, ConfStoreError> {
        let bytes = self.read_bytes()?;
        let backup = self.backup_at(at)?;

        let Outcome { value: raw, warnings } = apply_patch(RawLines::split(&bytes), patch);
        for w in &warnings {
            warn!("{}: {}", self.path.display(), w);
        }
        fs::write(&self.path, raw.render())
            .map_err(|source| ConfStoreError::Write { path: self.path.clone(), source })?;
        info!("updated {} (backup {})", self.path.display(), backup.display());
        Ok(Outcome::new(backup, warnings))
    }

    pub fn backup(&self) -> Result<PathBuf, ConfStoreError> {
        self.backup_at(now_local())
    }

    pub fn backup_at(&self, at: OffsetDateTime) -> Result<PathBuf, ConfStoreError> {
        let dest = backup_path(&self.path, at);
        fs::copy(&self.path, &dest)
            .map_err(|source| ConfStoreError::Backup { path: dest.clone(), source })?;
        Ok(dest)
    }
}

/// `<path>.bak.<YYYYMMDDHHMMSS>`
pub fn backup_path(path: &Path, at: OffsetDateTime) -> PathBuf {
    let fmt = format_description!("[year][month][day][hour][minute][second]");
    // The description only holds numeric components, formatting cannot fail.
    let stamp = at.format(&fmt).unwrap_or_else(|_| at.unix_timestamp().to_string());
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".bak.{stamp}"));
    PathBuf::from(name)
}

static LOCAL_OFFSET: OnceLock<UtcOffset> = OnceLock::new();

/// Local UTC offset, determined once. The lookup only succeeds while the
/// process is single-threaded, so call this before starting the runtime;
/// a later first call settles on UTC.
pub fn capture_local_offset() -> UtcOffset {
    *LOCAL_OFFSET.get_or_init(|| match UtcOffset::current_local_offset() {
        Ok(offset) => offset,
        Err(e) => {
            warn!("local UTC offset unavailable ({e}); timestamps use UTC");
            UtcOffset::UTC
        }
    })
}

pub fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(capture_local_offset())
}

/// Time left before a temporary disable lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remaining {
    Active { hours: i64, minutes: i64 },
    Expired,
    /// Operator-facing reason the window could not be computed.
    Invalid(String),
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remaining::Active { hours, minutes } => write!(f, "{hours}h {minutes:02}m"),
            Remaining::Expired => f.write_str("Expired"),
            Remaining::Invalid(reason) => f.write_str(reason),
        }
    }
}

pub fn remaining_disable_period(basic: &BTreeMap<String, String>, now: OffsetDateTime) -> Remaining {
    let Some(expire_hours) = basic.get("expire_hours").and_then(|v| v.parse::<f64>().ok()) else {
        return Remaining::Invalid("Invalid expire_hours".to_string());
    };
    let Some(timestamp) = basic.get("timestamp").and_then(|v| v.parse::<i64>().ok()) else {
        return Remaining::Invalid("Invalid timestamp".to_string());
    };

    let expire_at = timestamp.saturating_add((expire_hours * 3600.0) as i64);
    let now = now.unix_timestamp();
    if now >= expire_at {
        return Remaining::Expired;
    }
    let left = expire_at - now;
    Remaining::Active { hours: left / 3600, minutes: (left / 60) % 60 }
}
