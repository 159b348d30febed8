//! Parsers for `svn` command output.

use std::sync::OnceLock;

use regex_lite::Regex;
use tracing::debug;

/// Revisions of a working copy, from `svn info --xml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WcRevisions {
    /// Revision of the last commit that touched the working copy root.
    pub last_changed: String,
    /// Revision the working copy is updated to.
    pub checked_out: String,
}

impl WcRevisions {
    pub fn contains(&self, revision: &str) -> bool {
        self.last_changed == revision || self.checked_out == revision
    }
}

/// Local modifications, from `svn status --xml`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WcChanges {
    pub changed: bool,
    /// At least one change lies inside an `svn:externals` entry.
    pub externals_changed: bool,
}

pub fn parse_wc_revisions(xml: &str) -> WcRevisions {
    debug!("parsing svn info XML ({} bytes)", xml.len());
    let Some(entry) = element_fragment(xml, "entry") else {
        return WcRevisions {
            last_changed: "0".into(),
            checked_out: "0".into(),
        };
    };
    let checked_out = extract_attr_from_str(opening_tag(entry), "revision")
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "0".into());
    let last_changed = extract_attribute(entry, "commit", "revision")
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "0".into());
    WcRevisions {
        last_changed,
        checked_out,
    }
}

pub fn parse_wc_status(xml: &str) -> WcChanges {
    debug!("parsing svn status XML ({} bytes)", xml.len());
    let mut externals = Vec::new();
    let mut changes = Vec::new();
    for part in xml.split("<entry").skip(1) {
        let fragment = match part.find("</entry>") {
            Some(pos) => &part[..pos],
            None => part,
        };
        if !fragment.contains("<wc-status") {
            continue;
        }
        let path = xml_unescape(&extract_attr_from_str(opening_tag(fragment), "path").unwrap_or_default());
        let item = extract_attribute(fragment, "wc-status", "item").unwrap_or_default();
        let props = extract_attribute(fragment, "wc-status", "props").unwrap_or_default();
        if item == "external" {
            externals.push(path.clone());
        }
        let item_changed = !matches!(item.as_str(), "" | "normal" | "unversioned" | "external");
        let props_changed = !matches!(props.as_str(), "" | "none");
        if item_changed || props_changed {
            changes.push(path);
        }
    }

    let externals_changed = changes.iter().any(|path| {
        externals.iter().any(|ext| {
            path == ext
                || path
                    .strip_prefix(ext.as_str())
                    .is_some_and(|rest| rest.starts_with(['/', std::path::MAIN_SEPARATOR]))
        })
    });
    WcChanges {
        changed: !changes.is_empty(),
        externals_changed,
    }
}

fn committed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Committed revision ([0-9]+)\.").expect("Failed to compile commit regex"))
}

fn checked_out_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Checked out revision [0-9]+\.").expect("Failed to compile checkout regex"))
}

/// Revision number from `svn commit` output.
pub fn parse_committed_revision(output: &str) -> Option<String> {
    committed_re()
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn is_checkout_confirmation(output: &str) -> bool {
    checked_out_re().is_match(output)
}

/// Entries of `svn list --recursive`, without directories.
pub fn parse_file_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty() && !l.ends_with('/'))
        .map(str::to_string)
        .collect()
}

/// Property names listed by `svn proplist`.
pub fn parse_proplist(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| l.starts_with(char::is_whitespace))
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Last non-empty line, for error reporting.
pub fn last_line(output: &str) -> String {
    output
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}

/// The text between `<tag ...>` and `</tag>` (inclusive of attributes).
fn element_fragment<'x>(xml: &'x str, tag: &str) -> Option<&'x str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut search_from = 0;
    while let Some(rel_pos) = xml[search_from..].find(&open) {
        let start = search_from + rel_pos + open.len();
        // `<entry` must not match `<entrylist`
        if xml[start..]
            .chars()
            .next()
            .is_some_and(|c| c != '>' && !c.is_ascii_whitespace())
        {
            search_from = start;
            continue;
        }
        let rest = &xml[start..];
        let end = rest.find(&close).unwrap_or(rest.len());
        return Some(&rest[..end]);
    }
    None
}

/// The attribute part of a fragment produced by splitting on `<tag`.
fn opening_tag(fragment: &str) -> &str {
    match fragment.find('>') {
        Some(pos) => &fragment[..pos],
        None => fragment,
    }
}

/// Unescape standard XML entities.
fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn extract_attribute(xml: &str, tag: &str, attr: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let start_pos = xml.find(&open)?;
    let after_tag = &xml[start_pos + open.len()..];
    let tag_end = after_tag.find('>')?;
    extract_attr_from_str(&after_tag[..tag_end], attr)
}

fn extract_attr_from_str(s: &str, attr: &str) -> Option<String> {
    let padded = format!(" {s}").replace(['\n', '\r', '\t'], " ");
    for quote in ['"', '\''] {
        let pattern = format!(" {attr}={quote}");
        if let Some(pos) = padded.find(&pattern) {
            let after = &padded[pos + pattern.len()..];
            let end = after.find(quote)?;
            return Some(after[..end].to_string());
        }
    }
    None
}
