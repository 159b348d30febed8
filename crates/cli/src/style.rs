//! Shared styling utilities for terminal output.

use console::Style;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold).
pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Subrepo kind label, one colour per backend.
pub fn kind(kind: &str) -> String {
    let style = match kind {
        "native" => Style::new().cyan(),
        "svn" => Style::new().blue(),
        "git" => Style::new().magenta(),
        _ => Style::new(),
    };
    style.apply_to(kind).to_string()
}

/// Dirty indicator: modified (yellow dot) or clean (dim dot).
pub fn dirty(dirty: bool) -> String {
    if dirty {
        format!("{} modified", Style::new().yellow().apply_to("●"))
    } else {
        format!("{} clean", Style::new().dim().apply_to("○"))
    }
}
