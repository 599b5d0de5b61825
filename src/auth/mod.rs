//! Proof-of-knowledge gate in front of the vault.
//!
//! A secret is bound at creation time to a proof record produced by a
//! password-authenticated key exchange. Revealing it requires completing a
//! login exchange against that record. [`AuthGate`] tracks the pending logins
//! between the two round trips; the cryptography lives behind the
//! [`KeyExchange`] trait so the gate itself stays protocol-agnostic.

pub mod opaque;

pub use opaque::OpaqueExchange;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

const SESSION_ID_BYTES: usize = 16;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("opaque session not found")]
    SessionNotFound,

    #[error("opaque session expired")]
    SessionExpired,

    #[error("secret ID is required")]
    MissingSecretId,

    #[error("opaque record is required")]
    MissingRecord,

    #[error("key exchange failed: {0}")]
    Protocol(String),

    #[error("invalid server setup: {0}")]
    InvalidSetup(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Server half of a password-authenticated key exchange.
pub trait KeyExchange: Send + Sync + 'static {
    /// Server state carried from login start to login finish.
    type LoginState: Send + Sync + 'static;

    /// Answer a client's registration request for `secret_id`.
    fn registration_response(&self, secret_id: &str, request: &[u8]) -> AuthResult<Vec<u8>>;

    /// Begin a login against the stored `record`.
    fn login_start(
        &self,
        secret_id: &str,
        record: &[u8],
        request: &[u8],
    ) -> AuthResult<(Self::LoginState, Vec<u8>)>;

    /// Verify the client's finalization message.
    fn login_finish(&self, state: Self::LoginState, finalization: &[u8]) -> AuthResult<()>;
}

/// Reply to a registration start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationChallenge {
    pub secret_id: String,
    pub response: Vec<u8>,
}

/// Reply to a login start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginChallenge {
    pub session_id: String,
    pub response: Vec<u8>,
}

/// The capability the presentation layer consumes.
pub trait SecretGate: Send + Sync {
    /// Mint a secret id and answer the client's registration request for it.
    fn start_registration(&self, request: &[u8]) -> AuthResult<RegistrationChallenge>;

    /// Open a login session for `secret_id` against its stored proof record.
    fn start_login(
        &self,
        secret_id: &str,
        proof_record: &[u8],
        request: &[u8],
    ) -> AuthResult<LoginChallenge>;

    /// Consume a login session and return the id of the secret it unlocks.
    fn finish_login(&self, session_id: &str, finalization: &[u8]) -> AuthResult<String>;

    /// Drop sessions past their deadline. Returns how many went.
    fn evict_expired(&self) -> usize;
}

struct PendingLogin<S> {
    secret_id: String,
    state: S,
    expires_at: Instant,
}

/// Session bookkeeping around a [`KeyExchange`].
pub struct AuthGate<K: KeyExchange> {
    exchange: K,
    sessions: DashMap<String, PendingLogin<K::LoginState>>,
    session_ttl: Duration,
}

impl<K: KeyExchange> AuthGate<K> {
    pub fn new(exchange: K, session_ttl: Duration) -> Self {
        Self {
            exchange,
            sessions: DashMap::new(),
            session_ttl: session_ttl.max(Duration::from_secs(1)),
        }
    }

    /// Number of logins waiting for their finish message
    pub fn pending_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, pending| pending.expires_at >= now);
        before.saturating_sub(self.sessions.len())
    }

    fn finish_login_at(
        &self,
        session_id: &str,
        finalization: &[u8],
        now: Instant,
    ) -> AuthResult<String> {
        // Removing first makes every session single-use, whatever the outcome
        let (_, pending) = self.sessions.remove(session_id).ok_or_else(|| {
            debug!("Login finish for unknown session");
            AuthError::SessionNotFound
        })?;

        if now > pending.expires_at {
            debug!(secret_id = %pending.secret_id, "Login finish for expired session");
            return Err(AuthError::SessionExpired);
        }

        self.exchange.login_finish(pending.state, finalization)?;
        Ok(pending.secret_id)
    }
}

impl<K: KeyExchange> SecretGate for AuthGate<K> {
    fn start_registration(&self, request: &[u8]) -> AuthResult<RegistrationChallenge> {
        let secret_id = uuid::Uuid::new_v4().to_string();
        let response = self.exchange.registration_response(&secret_id, request)?;
        debug!(secret_id = %secret_id, "Registration started");
        Ok(RegistrationChallenge {
            secret_id,
            response,
        })
    }

    fn start_login(
        &self,
        secret_id: &str,
        proof_record: &[u8],
        request: &[u8],
    ) -> AuthResult<LoginChallenge> {
        if secret_id.is_empty() {
            return Err(AuthError::MissingSecretId);
        }
        if proof_record.is_empty() {
            return Err(AuthError::MissingRecord);
        }

        let (state, response) = self.exchange.login_start(secret_id, proof_record, request)?;
        let session_id = new_session_id();
        self.sessions.insert(
            session_id.clone(),
            PendingLogin {
                secret_id: secret_id.to_string(),
                state,
                expires_at: Instant::now() + self.session_ttl,
            },
        );

        debug!(secret_id = %secret_id, "Login session opened");
        Ok(LoginChallenge {
            session_id,
            response,
        })
    }

    fn finish_login(&self, session_id: &str, finalization: &[u8]) -> AuthResult<String> {
        self.finish_login_at(session_id, finalization, Instant::now())
    }

    fn evict_expired(&self) -> usize {
        let evicted = self.evict_expired_at(Instant::now());
        if evicted > 0 {
            info!(evicted, "Evicted expired login sessions");
        }
        evicted
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts a finalization equal to the stored record.
    struct EchoExchange;

    impl KeyExchange for EchoExchange {
        type LoginState = Vec<u8>;

        fn registration_response(&self, secret_id: &str, request: &[u8]) -> AuthResult<Vec<u8>> {
            let mut out = secret_id.as_bytes().to_vec();
            out.extend_from_slice(request);
            Ok(out)
        }

        fn login_start(
            &self,
            _secret_id: &str,
            record: &[u8],
            _request: &[u8],
        ) -> AuthResult<(Vec<u8>, Vec<u8>)> {
            Ok((record.to_vec(), b"challenge".to_vec()))
        }

        fn login_finish(&self, state: Vec<u8>, finalization: &[u8]) -> AuthResult<()> {
            if state == finalization {
                Ok(())
            } else {
                Err(AuthError::Protocol("mismatch".to_string()))
            }
        }
    }

    fn gate() -> AuthGate<EchoExchange> {
        AuthGate::new(EchoExchange, Duration::from_secs(120))
    }

    #[test]
    fn test_registration_mints_uuid() {
        let challenge = gate().start_registration(b"req").unwrap();
        assert!(uuid::Uuid::parse_str(&challenge.secret_id).is_ok());
        assert!(challenge.response.ends_with(b"req"));
    }

    #[test]
    fn test_login_round_trip_is_single_use() {
        let gate = gate();
        let challenge = gate.start_login("secret-1", b"record", b"ke1").unwrap();
        assert_eq!(challenge.response, b"challenge");
        assert_eq!(URL_SAFE_NO_PAD.decode(&challenge.session_id).unwrap().len(), 16);

        let id = gate.finish_login(&challenge.session_id, b"record").unwrap();
        assert_eq!(id, "secret-1");
        assert!(matches!(
            gate.finish_login(&challenge.session_id, b"record"),
            Err(AuthError::SessionNotFound)
        ));
    }

    #[test]
    fn test_failed_finish_consumes_session() {
        let gate = gate();
        let challenge = gate.start_login("secret-1", b"record", b"ke1").unwrap();
        assert!(matches!(
            gate.finish_login(&challenge.session_id, b"wrong"),
            Err(AuthError::Protocol(_))
        ));
        assert_eq!(gate.pending_sessions(), 0);
    }

    #[test]
    fn test_expired_session() {
        let gate = gate();
        let challenge = gate.start_login("secret-1", b"record", b"ke1").unwrap();
        let later = Instant::now() + Duration::from_secs(121);
        assert!(matches!(
            gate.finish_login_at(&challenge.session_id, b"record", later),
            Err(AuthError::SessionExpired)
        ));
    }

    #[test]
    fn test_start_login_requires_id_and_record() {
        let gate = gate();
        assert!(matches!(
            gate.start_login("", b"record", b"ke1"),
            Err(AuthError::MissingSecretId)
        ));
        assert!(matches!(
            gate.start_login("id", b"", b"ke1"),
            Err(AuthError::MissingRecord)
        ));
    }

    #[test]
    fn test_evict_expired_sessions() {
        let gate = gate();
        gate.start_login("a", b"r", b"q").unwrap();
        gate.start_login("b", b"r", b"q").unwrap();
        assert_eq!(gate.evict_expired_at(Instant::now()), 0);
        assert_eq!(gate.evict_expired_at(Instant::now() + Duration::from_secs(300)), 2);
        assert_eq!(gate.pending_sessions(), 0);
    }
}
