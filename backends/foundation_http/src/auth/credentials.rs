use std::time::SystemTime;

use zeroize::Zeroizing;

use crate::errors::HttpError;
use crate::synca::{self, Completion, OneShotFlag, ShutdownSignal, ShutdownWait};

/// An access key pair with an optional session token and expiry.
///
/// The secret and token are wiped from memory when dropped and never show
/// up in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: Zeroizing<String>,
    session_token: Option<Zeroizing<String>>,
    expires_at: Option<SystemTime>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("has_session_token", &self.session_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: Zeroizing::new(secret_access_key.into()),
            session_token: None,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(Zeroizing::new(token.into()));
        self
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    #[must_use]
    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    #[must_use]
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_ref().map(|token| token.as_str())
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// A source of [`Credentials`].
///
/// Consumers treat every provider the same way regardless of where the
/// credentials come from. Like the engine resources, providers close
/// asynchronously and report when they are done.
pub trait CredentialsProvider: Send + Sync {
    /// Resolves with the current credentials.
    fn get_credentials(&self) -> Completion<Result<Credentials, HttpError>>;

    fn close(&self);

    fn wait_for_shutdown(&self) -> ShutdownWait;
}

/// Hands out the same credentials every time.
#[derive(Debug)]
pub struct StaticCredentialsProvider {
    credentials: Credentials,
    closed: OneShotFlag,
    shutdown: ShutdownSignal,
}

impl StaticCredentialsProvider {
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            closed: OneShotFlag::new(),
            shutdown: ShutdownSignal::new("static credentials provider"),
        }
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn get_credentials(&self) -> Completion<Result<Credentials, HttpError>> {
        let (done, completion) = synca::channel();
        let result = if self.closed.is_fired() {
            Err(HttpError::ResourceClosed("credentials provider"))
        } else {
            Ok(self.credentials.clone())
        };
        let _ = done.complete(result);
        completion
    }

    fn close(&self) {
        if self.closed.fire() {
            self.shutdown.signal();
        }
    }

    fn wait_for_shutdown(&self) -> ShutdownWait {
        self.shutdown.listen()
    }
}

impl Drop for StaticCredentialsProvider {
    fn drop(&mut self) {
        self.close();
    }
}
