//! Pattern matching over free-text worker output
//!
//! The only signal of task state from a worker is its terminal output, so
//! completion, failure and stuck detection are all regex heuristics. The
//! sets are injectable: the executor and health monitor take whatever
//! patterns they are constructed with.

use regex::{Regex, RegexBuilder};

use crate::error::OrchestratorError;

/// Ordered list of compiled patterns with first-match semantics
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    /// Compile a pattern set; all patterns are case-insensitive
    pub fn compile(sources: &[&str]) -> Result<Self, OrchestratorError> {
        let mut patterns = Vec::with_capacity(sources.len());
        for source in sources {
            let regex = RegexBuilder::new(source)
                .case_insensitive(true)
                .multi_line(true)
                .build()
                .map_err(|e| {
                    OrchestratorError::Config(format!("bad pattern {source:?}: {e}"))
                })?;
            patterns.push(regex);
        }
        Ok(Self { patterns })
    }

    /// True if any pattern matches the text
    pub fn is_match(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }

    /// The first matching pattern's source, if any
    pub fn first_match(&self, text: &str) -> Option<&str> {
        self.patterns.iter().find(|p| p.is_match(text)).map(|p| p.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Default signals that a worker finished its task
    pub fn completion_defaults() -> Self {
        Self::compile(&[
            r"task complete",
            r"all tests pass",
            r"implementation complete",
            r"TASK_DONE",
        ])
        .unwrap_or_else(|_| Self { patterns: Vec::new() })
    }

    /// Default signals that a worker hit an unrecoverable error
    pub fn failure_defaults() -> Self {
        Self::compile(&[
            r"fatal error",
            r"unhandled exception",
            r"cannot continue",
            r"TASK_FAILED",
        ])
        .unwrap_or_else(|_| Self { patterns: Vec::new() })
    }

    /// Default signals that a worker is wedged: a spinner repeating with no
    /// progress, or a long run of blank lines
    pub fn stuck_defaults() -> Self {
        Self::compile(&[
            r"(?s)(thinking\W{0,3}\s*){3,}",
            r"(?:^[ \t]*\r?\n){8,}",
            r"(?s)esc to interrupt.{0,200}esc to interrupt.{0,200}esc to interrupt",
        ])
        .unwrap_or_else(|_| Self { patterns: Vec::new() })
    }

    /// Default signals of a crashed or erroring worker process
    pub fn error_defaults() -> Self {
        Self::compile(&[
            r"fatal error",
            r"segmentation fault",
            r"panicked at",
            r"command not found",
        ])
        .unwrap_or_else(|_| Self { patterns: Vec::new() })
    }
}
