use std::sync::OnceLock;

use thiserror::Error;
use zeroize::ZeroizeOnDrop;

pub const SESSION_SECRET_LEN: usize = 64;

static SESSION: OnceLock<SessionContext> = OnceLock::new();

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session context already initialized")]
    AlreadyInitialized,
    #[error("session context not initialized")]
    NotInitialized,
    #[error("randomness source failed")]
    RandomFailure,
}

/// The process-lifetime secret every field cipher is derived from. It is
/// generated from OS randomness, never persisted, and zeroized on drop, so
/// decrypted field values are only recoverable within the current run.
#[derive(ZeroizeOnDrop)]
pub struct SessionContext {
    secret: [u8; SESSION_SECRET_LEN],
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext").field("secret", &"[redacted]").finish()
    }
}

impl SessionContext {
    /// Generate the process-wide context and install it. Exactly one call may
    /// succeed; later calls fail rather than silently reusing or replacing
    /// the installed secret.
    pub fn initialize() -> Result<&'static SessionContext, SessionError> {
        let fresh = Self::unregistered()?;
        let mut installed_here = false;
        let context = SESSION.get_or_init(|| {
            installed_here = true;
            fresh
        });
        if installed_here {
            Ok(context)
        } else {
            Err(SessionError::AlreadyInitialized)
        }
    }

    pub fn current() -> Result<&'static SessionContext, SessionError> {
        SESSION.get().ok_or(SessionError::NotInitialized)
    }

    /// A context that is not installed as the process-wide one. Intended for
    /// embedders that manage their own lifetime, and for tests.
    pub fn unregistered() -> Result<Self, SessionError> {
        let mut secret = [0_u8; SESSION_SECRET_LEN];
        getrandom::fill(&mut secret).map_err(|_| SessionError::RandomFailure)?;
        Ok(Self { secret })
    }

    pub(crate) fn secret(&self) -> &[u8; SESSION_SECRET_LEN] {
        &self.secret
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionContext, SessionError};

    #[test]
    fn second_initialization_fails_loudly() {
        let first = SessionContext::initialize();
        match first {
            Ok(_) => {}
            // Another test in the process won the race; that is the same
            // single-initialization guarantee from this side.
            Err(SessionError::AlreadyInitialized) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            SessionContext::initialize(),
            Err(SessionError::AlreadyInitialized)
        ));
        assert!(SessionContext::current().is_ok());
    }

    #[test]
    fn unregistered_contexts_are_independent() {
        let one = SessionContext::unregistered().expect("context");
        let two = SessionContext::unregistered().expect("context");
        assert_ne!(one.secret(), two.secret());
    }
}
