//! Local, best-effort echo of events that could not be delivered.
//!
//! Events routed here count as handled: there is no retry queue behind the
//! sink. Each event is written as one JSON line. Write errors are logged and
//! swallowed.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use tracing::{error, warn};

use crate::metadata::Event;

/// Why a sub-batch ended up in the fallback sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// Workspace credentials are not configured
    Disabled,

    /// The circuit breaker rejected the delivery attempt
    CircuitOpen,

    /// The delivery attempt failed
    DeliveryFailed,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::Disabled => "disabled",
            FallbackReason::CircuitOpen => "circuit_open",
            FallbackReason::DeliveryFailed => "delivery_failed",
        }
    }
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line-oriented JSON writer used when remote delivery is unavailable.
pub struct FallbackSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl FallbackSink {
    /// Write to an arbitrary output stream.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Write to standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Emit events, one JSON object per line.
    ///
    /// Returns the number of events written. Events that fail to serialize
    /// are skipped; write errors abort the remainder of this call.
    pub fn emit(&self, events: &[Event], reason: FallbackReason) -> usize {
        let mut lines = String::new();
        let mut written = 0;
        for event in events {
            match event.to_json() {
                Ok(json) => {
                    lines.push_str(&json);
                    lines.push('\n');
                    written += 1;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        log_type = event.log_type(),
                        "Failed to serialize event for fallback output, dropping it"
                    );
                }
            }
        }

        if written == 0 {
            return 0;
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let result = writer
            .write_all(lines.as_bytes())
            .and_then(|()| writer.flush());
        if let Err(e) = result {
            warn!(error = %e, reason = %reason, "Failed to write fallback output");
            return 0;
        }

        written
    }
}

impl Default for FallbackSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl std::fmt::Debug for FallbackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackSink").finish_non_exhaustive()
    }
}
