//! Caller identity and the verifier seam used by the auth gate.
//!
//! Token cryptography lives behind [`IdentityVerifier`]; the pipeline only
//! needs "credential in, identity or reason out". [`StaticTokenVerifier`] is a
//! table-backed implementation for development, tests and service-to-service
//! keys.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// A verified caller, attached to request extensions by the auth gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Stable subject identifier (user id).
    pub subject: String,
    /// Human readable name.
    pub display_name: String,
    /// When the credential stops being valid.
    pub expires_at: DateTime<Utc>,
}

impl Identity {
    /// Build an identity.
    pub fn new(
        subject: impl Into<String>,
        display_name: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject: subject.into(),
            display_name: display_name.into(),
            expires_at,
        }
    }

    /// Whether the identity has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Why a credential was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// The credential could not be parsed.
    #[error("malformed credential: {0}")]
    Malformed(String),

    /// The credential was valid but has expired.
    #[error("credential expired")]
    Expired,

    /// The credential is not recognised or its signature does not match.
    #[error("credential signature invalid")]
    SignatureInvalid,
}

impl VerifyError {
    /// Machine-readable reason code returned to clients.
    pub fn reason_code(&self) -> &'static str {
        match self {
            VerifyError::Malformed(_) => "malformed",
            VerifyError::Expired => "expired",
            VerifyError::SignatureInvalid => "signature_invalid",
        }
    }
}

/// Turns a credential string into a verified [`Identity`].
///
/// Implementations must be synchronous and CPU-bound; the auth gate calls
/// them inline on the request task.
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Verify `credential`.
    fn verify(&self, credential: &str) -> Result<Identity, VerifyError>;
}

/// Verifier backed by a fixed table of credentials.
///
/// Lookups compare every stored credential in constant time, so response
/// timing does not reveal how much of a guess matched.
#[derive(Clone, Default)]
pub struct StaticTokenVerifier {
    entries: Vec<(String, Identity)>,
}

impl StaticTokenVerifier {
    /// Create an empty verifier (rejects everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` for `identity`. A later registration of the same
    /// token replaces the earlier one.
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        let token = token.into();
        self.entries.retain(|(existing, _)| *existing != token);
        self.entries.push((token, identity));
        self
    }

    /// Parse `token:subject:display_name[:expires_at]` entries.
    ///
    /// `expires_at` is RFC 3339; entries without it never expire.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid entry.
    pub fn from_specs<I, S>(specs: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut verifier = Self::new();
        for spec in specs {
            let (token, identity) = parse_token_spec(spec.as_ref())?;
            verifier = verifier.with_token(token, identity);
        }
        Ok(verifier)
    }

    /// Number of registered credentials.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no credential is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, credential: &str) -> Option<&Identity> {
        let provided = credential.as_bytes();
        let mut found = None;
        // Visit every entry regardless of where the match is.
        for (token, identity) in &self.entries {
            if bool::from(token.as_bytes().ct_eq(provided)) {
                found = Some(identity);
            }
        }
        found
    }
}

impl IdentityVerifier for StaticTokenVerifier {
    fn verify(&self, credential: &str) -> Result<Identity, VerifyError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(VerifyError::Malformed("empty credential".to_string()));
        }
        if credential.chars().any(char::is_whitespace) {
            return Err(VerifyError::Malformed(
                "credential contains whitespace".to_string(),
            ));
        }

        let identity = self.lookup(credential).ok_or(VerifyError::SignatureInvalid)?;
        if identity.is_expired_at(Utc::now()) {
            return Err(VerifyError::Expired);
        }
        Ok(identity.clone())
    }
}

impl fmt::Debug for StaticTokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the credentials themselves.
        let subjects: Vec<&str> = self
            .entries
            .iter()
            .map(|(_, identity)| identity.subject.as_str())
            .collect();
        f.debug_struct("StaticTokenVerifier")
            .field("subjects", &subjects)
            .finish()
    }
}

/// Parse one `token:subject:display_name[:expires_at]` entry.
///
/// The expiry may itself contain colons, so only the first three separators
/// split fields.
pub fn parse_token_spec(spec: &str) -> Result<(String, Identity), String> {
    let mut parts = spec.trim().splitn(4, ':');
    let token = parts.next().unwrap_or_default().trim();
    let subject = parts.next().map(str::trim).unwrap_or_default();
    let display_name = parts.next().map(str::trim).unwrap_or_default();

    if token.is_empty() || subject.is_empty() {
        return Err(format!(
            "invalid token entry '{}': expected token:subject:name[:expires_at]",
            redact(spec)
        ));
    }

    let expires_at = match parts.next().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| format!("invalid expiry for subject '{subject}': {e}"))?
            .with_timezone(&Utc),
        None => DateTime::<Utc>::MAX_UTC,
    };

    let display_name = if display_name.is_empty() {
        subject
    } else {
        display_name
    };

    Ok((
        token.to_string(),
        Identity::new(subject, display_name, expires_at),
    ))
}

/// Keep only the non-secret part of a token entry for error messages.
fn redact(spec: &str) -> String {
    match spec.split_once(':') {
        Some((_, rest)) => format!("***:{rest}"),
        None => "***".to_string(),
    }
}

/// Read the identity attached by the auth gate.
pub trait RequestIdentityExt {
    /// The verified caller, if the auth gate attached one.
    fn identity(&self) -> Option<&Identity>;
}

impl<B> RequestIdentityExt for axum::http::Request<B> {
    fn identity(&self) -> Option<&Identity> {
        self.extensions().get::<Identity>()
    }
}
