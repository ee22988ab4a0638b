// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! User-facing diagnostic events.
//!
//! The core never prints. It reports through a [`DiagnosticSink`]; the CLI
//! renders events on stderr with [`ConsoleSink`], library callers can keep
//! the default [`LogSink`] or collect events with [`MemorySink`].

use colored::Colorize;
use std::sync::Mutex;

/// Receives informational, error and verbose events from a run.
pub trait DiagnosticSink: Send + Sync {
    fn info(&self, _message: &str) {}

    fn error(&self, _message: &str) {}

    fn verbose(&self, _message: &str) {}
}

/// Sink that discards every event.
#[derive(Debug, Default)]
pub struct NoopSink;

impl DiagnosticSink for NoopSink {}

/// Sink that forwards events to the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn info(&self, message: &str) {
        log::info!("{message}");
    }

    fn error(&self, message: &str) {
        log::error!("{message}");
    }

    fn verbose(&self, message: &str) {
        log::debug!("{message}");
    }
}

/// Sink that writes prefixed, colored lines to stderr.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn prefix() -> String {
        "[mutex-run]".dimmed().to_string()
    }
}

impl DiagnosticSink for ConsoleSink {
    fn info(&self, message: &str) {
        eprintln!("{} {}", Self::prefix(), message.cyan());
    }

    fn error(&self, message: &str) {
        eprintln!("{} {}", Self::prefix(), message.red().bold());
    }

    fn verbose(&self, message: &str) {
        if self.verbose {
            eprintln!("{} {}", Self::prefix(), message.dimmed());
        }
    }
}

/// Level attached to a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Error,
    Verbose,
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(DiagnosticLevel, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(DiagnosticLevel, String)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn messages(&self, level: DiagnosticLevel) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|(event_level, _)| *event_level == level)
            .map(|(_, message)| message)
            .collect()
    }

    fn push(&self, level: DiagnosticLevel, message: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push((level, message.to_string()));
        }
    }
}

impl DiagnosticSink for MemorySink {
    fn info(&self, message: &str) {
        self.push(DiagnosticLevel::Info, message);
    }

    fn error(&self, message: &str) {
        self.push(DiagnosticLevel::Error, message);
    }

    fn verbose(&self, message: &str) {
        self.push(DiagnosticLevel::Verbose, message);
    }
}
