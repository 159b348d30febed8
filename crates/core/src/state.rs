//! Declared and recorded subrepo state.
//!
//! A parent snapshot declares its subrepos in `.subrepos`:
//!
//! ```text
//! # path = [kind]source
//! vendor/lib = ../lib
//! docs = [svn]https://svn.example.com/docs/trunk
//!
//! [subpaths]
//! ^https://old\.example\.com/(.*)$ = https://new.example.com/\1
//! ```
//!
//! and records the checked-in revision of each in `.subrepostate`, one
//! `"<revision> <path>"` line per subrepo, sorted by path.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::Path;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::errors::StateError;
use crate::models::{SubrepoPointer, SubrepoState, DEFAULT_KIND, DIRTY_MARKER};
use crate::snapshot::Snapshot;
use crate::ui::Diagnostics;

/// Declarative spec file, relative to the parent root.
pub const SPEC_FILE: &str = ".subrepos";

/// Recorded revisions, relative to the parent root.
pub const STATE_FILE: &str = ".subrepostate";

const REMAP_SECTION: &str = "subpaths";
const MAX_INCLUDE_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Remap rules
// ---------------------------------------------------------------------------

/// Regex rewrite applied to declared sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapRule {
    pub pattern: String,
    pub replacement: String,
}

impl RemapRule {
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }
}

struct CompiledRule {
    regex: Regex,
    template: String,
}

impl CompiledRule {
    fn compile(rule: &RemapRule) -> Result<Self, StateError> {
        let regex = Regex::new(&rule.pattern).map_err(|e| StateError::BadRemapPattern {
            pattern: rule.pattern.clone(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            regex,
            template: translate_backrefs(&rule.replacement),
        })
    }

    fn apply(&self, source: &str) -> String {
        self.regex
            .replacen(source, 1, self.template.as_str())
            .into_owned()
    }
}

/// Check that every rule compiles.
pub fn validate_rules(rules: &[RemapRule]) -> Result<(), StateError> {
    rules.iter().try_for_each(|r| CompiledRule::compile(r).map(|_| ()))
}

/// Rewrite `\N` backreferences into `${N}` so regex-lite expands them.
/// Other backslashes are kept literally.
fn translate_backrefs(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            out.push_str("${");
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                out.push(d);
                chars.next();
            }
            out.push('}');
        } else {
            out.push(c);
        }
    }
    out
}

/// Apply `rules` in order, each replacing at most its first match.
pub fn remap_source(source: &str, rules: &[RemapRule]) -> Result<String, StateError> {
    let mut out = source.to_string();
    for rule in rules {
        out = CompiledRule::compile(rule)?.apply(&out);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Spec file parsing
// ---------------------------------------------------------------------------

/// Parsed content of a spec file and its includes.
#[derive(Debug, Default)]
struct SpecFile {
    /// `path -> raw source` from the default section.
    entries: BTreeMap<String, String>,
    /// Remap rules from the `[subpaths]` section, in declaration order.
    remaps: Vec<RemapRule>,
}

impl SpecFile {
    fn set(&mut self, section: &str, key: String, value: String) {
        match section {
            "" => {
                self.entries.insert(key, value);
            }
            REMAP_SECTION => match self.remaps.iter_mut().find(|r| r.pattern == key) {
                Some(rule) => rule.replacement = value,
                None => self.remaps.push(RemapRule::new(key, value)),
            },
            _ => {}
        }
    }

    fn unset(&mut self, section: &str, key: &str) {
        match section {
            "" => {
                self.entries.remove(key);
            }
            REMAP_SECTION => self.remaps.retain(|r| r.pattern != key),
            _ => {}
        }
    }

    fn append(&mut self, section: &str, key: &str, extra: &str) {
        let value = match section {
            "" => self.entries.get_mut(key),
            REMAP_SECTION => self
                .remaps
                .iter_mut()
                .find(|r| r.pattern == key)
                .map(|r| &mut r.replacement),
            _ => None,
        };
        if let Some(value) = value {
            value.push('\n');
            value.push_str(extra);
        }
    }
}

struct SpecParser<'a> {
    snapshot: &'a dyn Snapshot,
    diag: &'a dyn Diagnostics,
    spec: SpecFile,
}

impl<'a> SpecParser<'a> {
    fn new(snapshot: &'a dyn Snapshot, diag: &'a dyn Diagnostics) -> Self {
        Self {
            snapshot,
            diag,
            spec: SpecFile::default(),
        }
    }

    /// Read `name` from the snapshot and parse it. A file that is listed but
    /// cannot be found on disk is treated as removed.
    fn read(&mut self, name: &str, depth: usize) -> Result<(), StateError> {
        if !self.snapshot.contains(name) {
            return Err(StateError::MissingSpecFile(name.to_string()));
        }
        let data = match self.snapshot.read(name) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.diag
                    .warn(&format!("warning: subrepo spec file {name} not found\n"));
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8_lossy(&data);
        self.parse(name, &text, depth)
    }

    fn parse(&mut self, name: &str, text: &str, depth: usize) -> Result<(), StateError> {
        let malformed = |line: usize, detail: String| StateError::MalformedSpec {
            file: name.to_string(),
            line,
            detail,
        };

        let mut section = String::new();
        // Last key set, for continuation lines.
        let mut last_key: Option<String> = None;

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim_end_matches('\r');

            if line.starts_with(|c: char| c == ' ' || c == '\t') && !line.trim().is_empty() {
                match &last_key {
                    Some(key) => {
                        self.spec.append(&section, key, line.trim());
                        continue;
                    }
                    None => {
                        return Err(malformed(lineno, format!("unexpected indentation: {}", line.trim())))
                    }
                }
            }
            last_key = None;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("%include") {
                let target = rest.trim();
                if target.is_empty() {
                    return Err(malformed(lineno, "%include needs a file name".into()));
                }
                if depth >= MAX_INCLUDE_DEPTH {
                    return Err(malformed(lineno, format!("include depth exceeded at {target}")));
                }
                let included = include_path(name, target);
                debug!(from = name, file = %included, "including subrepo spec");
                self.read(&included, depth + 1)?;
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("%unset") {
                self.spec.unset(&section, rest.trim());
                continue;
            }

            if trimmed.starts_with('[') {
                match trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                    Some(name) => {
                        section = name.trim().to_string();
                        continue;
                    }
                    None => return Err(malformed(lineno, format!("bad section header: {trimmed}"))),
                }
            }

            match trimmed.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    let key = key.trim().to_string();
                    self.spec.set(&section, key.clone(), value.trim().to_string());
                    last_key = Some(key);
                }
                _ => return Err(malformed(lineno, format!("parse error: {trimmed}"))),
            }
        }
        Ok(())
    }
}

/// Resolve an `%include` target relative to the including file.
fn include_path(including: &str, target: &str) -> String {
    match including.rsplit_once('/') {
        Some((dir, _)) if !target.starts_with('/') => format!("{dir}/{target}"),
        _ => target.trim_start_matches('/').to_string(),
    }
}

/// Split an optional `[kind]` prefix off a raw source.
fn split_kind(raw: &str, path: &str) -> Result<(String, String), StateError> {
    match raw.strip_prefix('[') {
        Some(rest) => match rest.split_once(']') {
            Some((kind, source)) => Ok((kind.to_string(), source.to_string())),
            None => Err(StateError::MalformedSpec {
                file: SPEC_FILE.to_string(),
                line: 0,
                detail: format!("missing ] in subrepo source for {path}"),
            }),
        },
        None => Ok((DEFAULT_KIND.to_string(), raw.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Recorded revisions
// ---------------------------------------------------------------------------

/// Parse `.subrepostate` content into `path -> revision`.
pub fn parse_revisions(text: &str) -> Result<BTreeMap<String, String>, StateError> {
    let mut revisions = BTreeMap::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (revision, path) = line.split_once(' ').ok_or_else(|| StateError::MalformedSpec {
            file: STATE_FILE.to_string(),
            line: idx + 1,
            detail: format!("expected '<revision> <path>', got '{line}'"),
        })?;
        revisions.insert(path.to_string(), revision.to_string());
    }
    Ok(revisions)
}

fn read_revisions(
    snapshot: &dyn Snapshot,
) -> Result<BTreeMap<String, String>, StateError> {
    if !snapshot.contains(STATE_FILE) {
        return Ok(BTreeMap::new());
    }
    match snapshot.read(STATE_FILE) {
        Ok(data) => parse_revisions(&String::from_utf8_lossy(&data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Resolve / write
// ---------------------------------------------------------------------------

/// Compute the subrepo state of `snapshot`.
///
/// Remap rules from the spec file's `[subpaths]` section come first; a
/// configured rule with the same pattern replaces it in place, other
/// configured rules are appended.
pub fn resolve(
    snapshot: &dyn Snapshot,
    rules: &[RemapRule],
    diag: &dyn Diagnostics,
) -> Result<SubrepoState, StateError> {
    let mut parser = SpecParser::new(snapshot, diag);
    if snapshot.contains(SPEC_FILE) {
        parser.read(SPEC_FILE, 0)?;
    }
    let mut spec = parser.spec;
    for rule in rules {
        spec.set(REMAP_SECTION, rule.pattern.clone(), rule.replacement.clone());
    }

    let compiled = spec
        .remaps
        .iter()
        .map(CompiledRule::compile)
        .collect::<Result<Vec<_>, _>>()?;
    let revisions = read_revisions(snapshot)?;

    let mut state = SubrepoState::new();
    for (path, raw) in spec.entries {
        let (kind, source) = split_kind(&raw, &path)?;
        let source = compiled.iter().fold(source, |src, rule| rule.apply(&src));
        let revision = revisions.get(&path).cloned().unwrap_or_default();
        state.insert(
            path,
            SubrepoPointer::new(source.trim(), revision, kind),
        );
    }
    debug!(count = state.len(), "resolved subrepo state");
    Ok(state)
}

/// Render the state file content: sorted, no dirty markers.
pub fn format_state(state: &SubrepoState) -> String {
    state
        .iter()
        .map(|(path, p)| {
            let revision = p.revision.strip_suffix(DIRTY_MARKER).unwrap_or(&p.revision);
            format!("{revision} {path}\n")
        })
        .collect()
}

/// Replace `<root>/.subrepostate` with `state`.
///
/// The content goes to a temporary file in `root` which is synced and then
/// renamed over the old record.
#[instrument(skip(state), fields(root = %root.display(), count = state.len()))]
pub fn write_state(root: &Path, state: &SubrepoState) -> Result<(), StateError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".subrepostate-")
        .tempfile_in(root)?;
    tmp.write_all(format_state(state).as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(root.join(STATE_FILE)).map_err(|e| e.error)?;
    info!("recorded subrepo state");
    Ok(())
}
