//! OPAQUE (RFC 9807) server: Ristretto255 with TripleDH and Argon2 as the
//! key-stretching function.
//!
//! The proof record stored with each secret is the client's serialized
//! registration upload. The secret id doubles as the credential identifier.

use super::{AuthError, AuthResult, KeyExchange};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use opaque_ke::ciphersuite::CipherSuite;
use opaque_ke::key_exchange::tripledh::TripleDh;
use opaque_ke::{
    CredentialFinalization, CredentialRequest, RegistrationRequest, RegistrationUpload,
    Ristretto255, ServerLogin, ServerLoginStartParameters, ServerRegistration, ServerSetup,
};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Cipher suite shared with browser clients.
pub struct Suite;

impl CipherSuite for Suite {
    type OprfCs = Ristretto255;
    type KeGroup = Ristretto255;
    type KeyExchange = TripleDh;
    type Ksf = Argon2<'static>;
}

pub struct OpaqueExchange {
    setup: ServerSetup<Suite>,
}

impl OpaqueExchange {
    /// Fresh server keys. Records registered against one setup cannot log in
    /// against another.
    pub fn generate() -> Self {
        Self {
            setup: ServerSetup::<Suite>::new(&mut OsRng),
        }
    }

    /// Restore a setup produced by [`OpaqueExchange::to_base64`].
    pub fn from_base64(encoded: &str) -> AuthResult<Self> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|e| AuthError::InvalidSetup(e.to_string()))?,
        );
        let setup = ServerSetup::<Suite>::deserialize(&bytes)
            .map_err(|e| AuthError::InvalidSetup(e.to_string()))?;
        Ok(Self { setup })
    }

    pub fn to_base64(&self) -> String {
        let bytes = Zeroizing::new(self.setup.serialize().to_vec());
        BASE64.encode(bytes.as_slice())
    }
}

fn protocol(context: &str, e: impl std::fmt::Display) -> AuthError {
    AuthError::Protocol(format!("{}: {}", context, e))
}

impl KeyExchange for OpaqueExchange {
    type LoginState = ServerLogin<Suite>;

    fn registration_response(&self, secret_id: &str, request: &[u8]) -> AuthResult<Vec<u8>> {
        if secret_id.is_empty() {
            return Err(AuthError::MissingSecretId);
        }
        let request = RegistrationRequest::<Suite>::deserialize(request)
            .map_err(|e| protocol("registration request", e))?;
        let result = ServerRegistration::<Suite>::start(&self.setup, request, secret_id.as_bytes())
            .map_err(|e| protocol("registration response", e))?;
        Ok(result.message.serialize().to_vec())
    }

    fn login_start(
        &self,
        secret_id: &str,
        record: &[u8],
        request: &[u8],
    ) -> AuthResult<(ServerLogin<Suite>, Vec<u8>)> {
        let upload = RegistrationUpload::<Suite>::deserialize(record)
            .map_err(|e| protocol("stored record", e))?;
        let password_file = ServerRegistration::<Suite>::finish(upload);
        let request = CredentialRequest::<Suite>::deserialize(request)
            .map_err(|e| protocol("credential request", e))?;

        let result = ServerLogin::start(
            &mut OsRng,
            &self.setup,
            Some(password_file),
            request,
            secret_id.as_bytes(),
            ServerLoginStartParameters::default(),
        )
        .map_err(|e| protocol("login start", e))?;

        Ok((result.state, result.message.serialize().to_vec()))
    }

    fn login_finish(&self, state: ServerLogin<Suite>, finalization: &[u8]) -> AuthResult<()> {
        let finalization = CredentialFinalization::<Suite>::deserialize(finalization)
            .map_err(|e| protocol("credential finalization", e))?;
        state
            .finish(finalization)
            .map_err(|e| protocol("login finish", e))?;
        Ok(())
    }
}
