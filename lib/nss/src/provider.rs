// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers allow the driver to run in different contexts by letting
//! the host supply implementations of core services. Logging is the
//! only one today: a production host routes it into its structured
//! logger, unit tests print or record it.

use core::fmt;
use core::fmt::Display;
use slog::Drain;
use slog::Logger;
use slog::o;

#[cfg(any(feature = "test-help", test))]
use crate::ddi::sync::KMutex;

/// The set of all host-specific providers required by a driver
/// instance.
pub struct Providers {
    pub log: Box<dyn LogProvider>,
}

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the driver is running.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog;

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{level} {msg}");
    }
}

/// Route driver logging into an [`slog::Logger`].
pub struct SlogLog {
    log: Logger,
}

impl SlogLog {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }

    /// A terminal logger, filtered by `RUST_LOG`, writing from a
    /// background thread so that the receive path never blocks on the
    /// terminal.
    pub fn term() -> Self {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain).ignore_res();
        let drain = slog_async::Async::new(drain).build().fuse();
        Self { log: Logger::root(drain, o!("component" => "nss")) }
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }
}

impl LogProvider for SlogLog {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Note => slog::info!(self.log, "{}", msg),
            LogLevel::Warn => slog::warn!(self.log, "{}", msg),
            LogLevel::Error => slog::error!(self.log, "{}", msg),
        }
    }
}

/// A provider that keeps every line, so tests can assert on what was
/// (or was not) logged.
#[cfg(any(feature = "test-help", test))]
#[derive(Default)]
pub struct RecordLog {
    lines: KMutex<Vec<(LogLevel, String)>>,
}

#[cfg(any(feature = "test-help", test))]
impl RecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().clone()
    }

    pub fn count_matching(&self, level: LogLevel, needle: &str) -> usize {
        self.lines
            .lock()
            .iter()
            .filter(|(l, m)| *l == level && m.contains(needle))
            .count()
    }
}

#[cfg(any(feature = "test-help", test))]
impl LogProvider for RecordLog {
    fn log(&self, level: LogLevel, msg: &str) {
        self.lines.lock().push((level, msg.to_string()));
    }
}

#[cfg(any(feature = "test-help", test))]
impl LogProvider for std::sync::Arc<RecordLog> {
    fn log(&self, level: LogLevel, msg: &str) {
        self.as_ref().log(level, msg)
    }
}
