//! Test doubles for the executor, prompt and diagnostics collaborators.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;

use crate::exec::{CommandExecutor, CommandOutput, Invocation};
use crate::ui::{Diagnostics, Prompt};

struct Rule {
    program: String,
    prefix: Vec<String>,
    output: CommandOutput,
}

impl Rule {
    fn matches(&self, inv: &Invocation) -> bool {
        inv.program == self.program
            && inv.args.len() >= self.prefix.len()
            && inv.args.iter().zip(&self.prefix).all(|(a, p)| a == p)
    }
}

/// Answers invocations from a script and records every call.
///
/// Rules match on program and argument prefix. When several rules match,
/// the first one is used up; the last remaining match is reused for every
/// later call. Unscripted invocations exit with status 127.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<Invocation>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, program: &str, prefix: &[&str], status: i32, stdout: impl Into<Vec<u8>>) -> Self {
        self.rules.borrow_mut().push(Rule {
            program: program.to_string(),
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            output: CommandOutput {
                status,
                stdout: stdout.into(),
                stderr: String::new(),
            },
        });
        self
    }

    /// Every invocation seen so far.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    /// Calls rendered as `program arg...`.
    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.to_string()).collect()
    }

    /// Number of calls whose arguments start with `prefix`.
    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.args.len() >= prefix.len() && c.args.iter().zip(prefix).all(|(a, p)| a == p))
            .count()
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        self.calls.borrow_mut().push(invocation.clone());
        let mut rules = self.rules.borrow_mut();
        let matching: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.matches(invocation))
            .map(|(i, _)| i)
            .collect();
        match matching.as_slice() {
            [] => Ok(CommandOutput {
                status: 127,
                stdout: Vec::new(),
                stderr: format!("unscripted: {invocation}"),
            }),
            [only] => Ok(rules[*only].output.clone()),
            [first, ..] => Ok(rules.remove(*first).output),
        }
    }
}

/// Answers prompts from a queue; falls back to the default once empty.
#[derive(Default)]
pub(crate) struct ScriptedPrompt {
    answers: RefCell<VecDeque<Option<usize>>>,
    asked: RefCell<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn answering(answers: &[Option<usize>]) -> Self {
        Self {
            answers: RefCell::new(answers.iter().copied().collect()),
            asked: RefCell::default(),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.borrow().clone()
    }
}

impl Prompt for ScriptedPrompt {
    fn choose(&self, message: &str, _choices: [&str; 2], default: usize) -> Option<usize> {
        self.asked.borrow_mut().push(message.to_string());
        self.answers.borrow_mut().pop_front().unwrap_or(Some(default))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    Status,
    Note,
    Warn,
    Debug,
}

/// Keeps every message for later assertions.
#[derive(Default)]
pub(crate) struct RecordingDiagnostics {
    messages: RefCell<Vec<(Level, String)>>,
    progress: RefCell<Vec<(String, Option<usize>, Option<usize>)>>,
}

impl RecordingDiagnostics {
    fn at(&self, level: Level) -> Vec<String> {
        self.messages
            .borrow()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.at(Level::Status)
    }

    pub fn notes(&self) -> Vec<String> {
        self.at(Level::Note)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.at(Level::Warn)
    }

    pub fn debugs(&self) -> Vec<String> {
        self.at(Level::Debug)
    }

    pub fn progress(&self) -> Vec<(String, Option<usize>, Option<usize>)> {
        self.progress.borrow().clone()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn status(&self, message: &str) {
        self.messages.borrow_mut().push((Level::Status, message.to_string()));
    }

    fn note(&self, message: &str) {
        self.messages.borrow_mut().push((Level::Note, message.to_string()));
    }

    fn warn(&self, message: &str) {
        self.messages.borrow_mut().push((Level::Warn, message.to_string()));
    }

    fn debug(&self, message: &str) {
        self.messages.borrow_mut().push((Level::Debug, message.to_string()));
    }

    fn progress(&self, topic: &str, pos: Option<usize>, total: Option<usize>) {
        self.progress.borrow_mut().push((topic.to_string(), pos, total));
    }
}
