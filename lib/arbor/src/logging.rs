use crate::errors::{ErrorCode, Result};

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

use std::path::Path;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Verbosity levels accepted by the public logging setup. Anything negative
/// disables logging altogether.
pub const VB_FATAL: i32 = 0;
pub const VB_ERROR: i32 = 1;
pub const VB_WARNING: i32 = 2;
pub const VB_INFO: i32 = 3;
pub const VB_DEBUG: i32 = 4;
pub const VB_TRACE: i32 = 5;

fn severity(verbosity: i32) -> Severity {
    match verbosity {
        VB_FATAL => Severity::Critical,
        VB_ERROR => Severity::Error,
        VB_WARNING => Severity::Warning,
        VB_INFO => Severity::Info,
        VB_DEBUG => Severity::Debug,
        _ => Severity::Trace,
    }
}

/// A logger that swallows everything. Components take this as the default so
/// logging stays opt-in, the same way the channels do.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Creates a file logger with the given verbosity. A negative verbosity
/// returns the discard logger.
pub fn file<P: AsRef<Path>>(path: P, verbosity: i32) -> Result<Logger> {
    if verbosity < 0 {
        return Ok(discard());
    }

    FileLoggerBuilder::new(path)
        .level(severity(verbosity))
        .build()
        .map_err(|_| ErrorCode::CannotCreateLogFile)
}

/// Creates a terminal logger writing to stderr. Used by service binaries and
/// ad-hoc debugging.
pub fn terminal(verbosity: i32) -> Logger {
    if verbosity < 0 {
        return discard();
    }

    TerminalLoggerBuilder::new()
        .level(severity(verbosity))
        .destination(Destination::Stderr)
        .build()
        .expect("Building a terminal logger cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_verbosity_discards() {
        let log = file("/nonexistent/dir/never-created.log", -1).unwrap();
        trace!(log, "goes nowhere");
    }

    #[test]
    fn test_unwritable_file_fails() {
        let result = file("/nonexistent/dir/never-created.log", VB_INFO);
        assert_eq!(ErrorCode::CannotCreateLogFile, result.err().unwrap());
    }
}
