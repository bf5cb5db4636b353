pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the process-wide terminal logger. Verbose mode lowers the floor to
/// trace, otherwise informational and up.
pub fn init(verbose: bool) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.destination(Destination::Stderr);
    builder.level(if verbose { Severity::Trace } else { Severity::Info });

    builder.build().expect("Failed to construct terminal logger")
}

/// A logger that swallows everything. Handed to components constructed
/// without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_accepts_records() {
        let log = discard();
        info!(log, "no-op"; "key" => 1);
    }
}
