//! Terminal implementations of the core's prompt and diagnostics
//! collaborators.

use std::cell::RefCell;

use dialoguer::Select;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use subsync_core::ui::{choice_label, Diagnostics, Prompt};

use crate::style;

/// Asks the operator through a `dialoguer` selection list.
///
/// Escape or a terminal error counts as declining, which aborts the
/// running merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct DialoguerPrompt;

impl Prompt for DialoguerPrompt {
    fn choose(&self, message: &str, choices: [&str; 2], default: usize) -> Option<usize> {
        let items = choices.map(choice_label);
        match Select::new()
            .with_prompt(message.trim())
            .items(&items)
            .default(default)
            .interact_opt()
        {
            Ok(choice) => choice,
            Err(e) => {
                debug!(error = %e, "prompt failed");
                None
            }
        }
    }
}

/// Prints status and warnings to stderr and renders progress as a bar.
pub struct CliDiagnostics {
    quiet: bool,
    verbose: bool,
    bar: RefCell<Option<(String, ProgressBar)>>,
}

impl CliDiagnostics {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        Self {
            quiet,
            verbose,
            bar: RefCell::new(None),
        }
    }

    fn print(&self, message: &str) {
        let message = message.trim_end();
        match self.bar.borrow().as_ref() {
            Some((_, bar)) => bar.suspend(|| eprintln!("{message}")),
            None => eprintln!("{message}"),
        }
    }
}

impl Diagnostics for CliDiagnostics {
    fn status(&self, message: &str) {
        if !self.quiet {
            self.print(message);
        }
    }

    fn note(&self, message: &str) {
        if self.verbose {
            self.print(&style::dim(message.trim_end()));
        }
    }

    fn warn(&self, message: &str) {
        self.print(&style::warn(message.trim()));
    }

    fn debug(&self, message: &str) {
        debug!("{}", message.trim_end());
    }

    fn progress(&self, topic: &str, pos: Option<usize>, total: Option<usize>) {
        if self.quiet {
            return;
        }
        let mut slot = self.bar.borrow_mut();
        let Some(pos) = pos else {
            if let Some((_, bar)) = slot.take() {
                bar.finish_and_clear();
            }
            return;
        };
        if slot.as_ref().map_or(true, |(t, _)| t != topic) {
            if let Some((_, bar)) = slot.take() {
                bar.finish_and_clear();
            }
            let bar = match total {
                Some(total) => ProgressBar::new(total as u64),
                None => ProgressBar::new_spinner(),
            };
            if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:30.cyan/blue}] {pos}/{len}") {
                bar.set_style(style.progress_chars("=> "));
            }
            bar.set_message(topic.to_string());
            *slot = Some((topic.to_string(), bar));
        }
        if let Some((_, bar)) = slot.as_ref() {
            bar.set_position(pos as u64);
        }
    }
}
