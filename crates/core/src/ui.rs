//! Operator-facing collaborators: prompts and diagnostics.
//!
//! Both are passed explicitly into every engine and adapter call. The core
//! never talks to a terminal itself.

use tracing::{debug, info, warn};

/// Asks the operator to pick one of two choices.
///
/// Choice labels may mark their accelerator key with `&` (`"&Local"`);
/// use [`choice_label`] to strip it for display.
pub trait Prompt {
    /// Returns the chosen index, or `None` if the operator declined to answer.
    fn choose(&self, message: &str, choices: [&str; 2], default: usize) -> Option<usize>;
}

/// Receives informational output. Never influences control flow.
pub trait Diagnostics {
    /// Progress the operator normally wants to see.
    fn status(&self, message: &str);

    /// Verbose-only notes.
    fn note(&self, message: &str);

    fn warn(&self, message: &str);

    fn debug(&self, message: &str);

    /// Report `pos` out of `total` for `topic`; `pos == None` ends the topic.
    fn progress(&self, topic: &str, pos: Option<usize>, total: Option<usize>);
}

/// Strip the `&` accelerator marker from a choice label.
pub fn choice_label(choice: &str) -> String {
    choice.replacen('&', "", 1)
}

/// Answers every prompt with its default choice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl Prompt for NonInteractive {
    fn choose(&self, message: &str, choices: [&str; 2], default: usize) -> Option<usize> {
        debug!(
            message,
            answer = %choice_label(choices[default]),
            "non-interactive prompt answered with default"
        );
        Some(default)
    }
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn status(&self, message: &str) {
        info!("{}", message.trim_end());
    }

    fn note(&self, message: &str) {
        debug!("{}", message.trim_end());
    }

    fn warn(&self, message: &str) {
        warn!("{}", message.trim_end());
    }

    fn debug(&self, message: &str) {
        debug!("{}", message.trim_end());
    }

    fn progress(&self, topic: &str, pos: Option<usize>, total: Option<usize>) {
        match pos {
            Some(pos) => debug!(topic, pos, ?total, "progress"),
            None => debug!(topic, "progress complete"),
        }
    }
}
