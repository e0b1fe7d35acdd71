//! Per-instance diagnostic output.
//!
//! An [`Output`] prefixes every message with its owner's name and filters
//! verbose messages against a numeric verbosity. Everything is emitted
//! through `tracing`.

use crate::error::SimError;

/// Diagnostic channel of a component or subsystem.
#[derive(Clone, Debug)]
pub struct Output {
    prefix: String,
    verbosity: u32,
}

impl Output {
    /// Creates an output whose verbose messages up to `verbosity` are shown.
    pub fn new(prefix: impl Into<String>, verbosity: u32) -> Self {
        Self {
            prefix: prefix.into(),
            verbosity,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn verbosity(&self) -> u32 {
        self.verbosity
    }

    pub fn set_verbosity(&mut self, verbosity: u32) {
        self.verbosity = verbosity;
    }

    /// Returns true if a message at `level` would be emitted.
    pub fn enabled(&self, level: u32) -> bool {
        level <= self.verbosity
    }

    /// Emits `message` if `level` is within the verbosity.
    pub fn verbose(&self, level: u32, message: impl AsRef<str>) {
        if self.enabled(level) {
            tracing::info!(source = %self.prefix, level, "{}", message.as_ref());
        }
    }

    /// Unconditional informational output.
    pub fn output(&self, message: impl AsRef<str>) {
        tracing::info!(source = %self.prefix, "{}", message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        tracing::warn!(source = %self.prefix, "{}", message.as_ref());
    }

    /// Logs and builds a fatal error carrying the caller's location.
    ///
    /// Return it from the handler or hook to abort the run.
    #[track_caller]
    pub fn fatal(&self, message: impl AsRef<str>) -> SimError {
        let err = SimError::fatal(format!("{}: {}", self.prefix, message.as_ref()));
        tracing::error!(source = %self.prefix, "{}", err);
        err
    }
}
