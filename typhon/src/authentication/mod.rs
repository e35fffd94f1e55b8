//! SASL authentication providers.

use async_trait::async_trait;

pub use crate::errors::AuthError;

/// One SASL exchange in progress. A new session is created for every
/// connection the server demands authentication on.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Handles a server challenge. The token is protocol-specific and
    /// may be absent or empty.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Handles the success phase of the exchange.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// A factory of [`AuthenticatorSession`]s, invoked when the server sends
/// AUTHENTICATE during the handshake.
#[async_trait]
pub trait AuthenticatorProvider: Send + Sync {
    /// Returns the initial response and the session handling subsequent
    /// challenges.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

/// Plain SASL username/password authentication, as used by the password
/// authenticators of Cassandra and Scylla.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn initial_response(&self) -> Vec<u8> {
        // PLAIN: authzid NUL authcid NUL passwd
        let mut response = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        response.push(0);
        response.extend_from_slice(self.username.as_bytes());
        response.push(0);
        response.extend_from_slice(self.password.as_bytes());
        response
    }
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err(AuthError::Rejected(
            "Challenges are not expected during plain-text authentication".to_owned(),
        ))
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((
            Some(self.initial_response()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_initial_response_layout() {
        let auth = PlainTextAuthenticator::new("cassandra", "secret");
        let (initial, _session) = auth
            .start_authentication_session("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();
        assert_eq!(initial.unwrap(), b"\0cassandra\0secret");
    }
}
