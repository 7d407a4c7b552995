//! Pluggable authentication token providers.
//!
//! Mechanism internals (NTLM, Kerberos, SPNEGO wrapping) live outside this
//! crate. A provider only turns server challenges into client tokens and,
//! once it has one, reports the session key.

use crate::crypto::SecretKey;
use crate::error::Result;

/// Output of one authentication round.
#[derive(Debug, Default)]
pub struct AuthStep {
    /// Token to send in the next session setup request.
    pub token: Vec<u8>,
    /// Session key, once the mechanism has derived it.
    pub session_key: Option<SecretKey>,
}

impl AuthStep {
    /// A round that sends `token` and has no session key yet.
    pub fn token(token: impl Into<Vec<u8>>) -> Self {
        Self {
            token: token.into(),
            session_key: None,
        }
    }

    /// Attaches the session key the mechanism derived.
    pub fn with_key(mut self, key: SecretKey) -> Self {
        self.session_key = Some(key);
        self
    }
}

/// Supplies session setup tokens and, eventually, the session key.
pub trait AuthProvider: Send {
    /// Produces the next token. `challenge` is `None` on the first round and
    /// the server's token afterwards.
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<AuthStep>;

    /// Receives the server's token from the final successful response.
    fn finish(&mut self, _token: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Anonymous logon: one empty token and no session key.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl AuthProvider for Anonymous {
    fn step(&mut self, _challenge: Option<&[u8]>) -> Result<AuthStep> {
        Ok(AuthStep::default())
    }
}
