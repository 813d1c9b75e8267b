//! What BAC and PACE sessions have in common, and the exclusion handle that
//! makes every operation on a session atomic.

use alloc::sync::Arc;
use core::fmt;

use parking_lot::Mutex;

/// The handshake a session implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Bac,
    Pace,
}

impl Protocol {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bac => "BAC",
            Self::Pace => "PACE",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Contract shared by the handshake state machines.
pub trait HandshakeSession {
    fn protocol(&self) -> Protocol;

    /// Name of the current state, e.g. `CHALLENGE_GENERATED`.
    fn state_name(&self) -> &'static str;

    fn is_authenticated(&self) -> bool;

    /// Returns to the initial state, keeping the document.
    fn reset(&mut self);

    /// Drives the session to its failed state. Used when an operation that
    /// already ran can no longer be reported to its caller.
    fn abort(&mut self);
}

/// Shared handle to a session; every access holds the session's lock, so a
/// check-then-set operation can never interleave with another.
///
/// ```
/// use emrtd_emulator::{
///     bac::{BacSession, BacState},
///     crypto::DeterministicCrypto,
///     session::SessionHandle,
/// };
///
/// let handle = SessionHandle::new(BacSession::with_crypto(DeterministicCrypto::default()));
/// let other = handle.clone();
/// assert_eq!(other.with(|session| session.state()), BacState::Initial);
/// ```
pub struct SessionHandle<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> SessionHandle<S> {
    pub fn new(session: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Runs `f` with exclusive access to the session.
    pub fn with<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        f(&mut *self.inner.lock())
    }

    pub(crate) fn shared(&self) -> &Arc<Mutex<S>> {
        &self.inner
    }
}

impl<S> Clone for SessionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for SessionHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(session) => f.debug_tuple("SessionHandle").field(&*session).finish(),
            None => f.write_str("SessionHandle(<locked>)"),
        }
    }
}
