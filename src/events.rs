//! Notifications for the application surrounding the emulator. Delivery is
//! best effort and never affects the response sent to the terminal.

use alloc::string::String;
use core::fmt;

use tracing::{error, info, warn};

use crate::{error::SimulatorError, session::Protocol};

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SimulatorEvent {
    ConnectionEstablished,
    ConnectionLost {
        reason: String,
    },
    HandshakeStepStarted {
        protocol: Protocol,
        /// 1-based step of the handshake.
        step: u8,
        command: &'static str,
    },
    AuthenticationSucceeded {
        protocol: Protocol,
    },
    AuthenticationFailed {
        protocol: Protocol,
        error: SimulatorError,
    },
    Error {
        error: SimulatorError,
    },
}

impl fmt::Display for SimulatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionEstablished => f.write_str("Terminal connected"),
            Self::ConnectionLost { reason } => write!(f, "Connection lost: {reason}"),
            Self::HandshakeStepStarted {
                protocol,
                step,
                command,
            } => write!(f, "{protocol} step {step} started ({command})"),
            Self::AuthenticationSucceeded { protocol } => {
                write!(f, "{protocol} authentication succeeded")
            }
            Self::AuthenticationFailed { protocol, error } => {
                write!(f, "{protocol} authentication failed: {error}")
            }
            Self::Error { error } => write!(f, "Error: {error}"),
        }
    }
}

/// Receives emulator events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SimulatorEvent);
}

/// Forwards every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &SimulatorEvent) {
        match *event {
            SimulatorEvent::AuthenticationFailed { .. } | SimulatorEvent::ConnectionLost { .. } => {
                warn!("{event}");
            }
            SimulatorEvent::Error { .. } => error!("{event}"),
            _ => info!("{event}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::{sync::Arc, vec::Vec};
    use parking_lot::Mutex;

    /// Keeps every event it receives.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct RecordingSink {
        events: Arc<Mutex<Vec<SimulatorEvent>>>,
    }

    impl RecordingSink {
        pub(crate) fn events(&self) -> Vec<SimulatorEvent> {
            self.events.lock().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: &SimulatorEvent) {
            self.events.lock().push(event.clone());
        }
    }

    #[test]
    fn test_display() {
        let event = SimulatorEvent::HandshakeStepStarted {
            protocol: Protocol::Pace,
            step: 2,
            command: "GENERAL AUTHENTICATE",
        };
        assert_eq!(
            event.to_string(),
            "PACE step 2 started (GENERAL AUTHENTICATE)"
        );
        assert_eq!(
            SimulatorEvent::ConnectionLost {
                reason: "field off".into()
            }
            .to_string(),
            "Connection lost: field off"
        );
    }

    #[test]
    fn test_sinks() {
        let recording = RecordingSink::default();
        let sinks: [&dyn EventSink; 2] = [&TracingEventSink, &recording];
        for sink in sinks {
            sink.emit(&SimulatorEvent::ConnectionEstablished);
        }
        assert_eq!(recording.events(), vec![SimulatorEvent::ConnectionEstablished]);
    }
}
