//! Fuzz testing for credential extraction in the auth gate.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_credential
//! ```
//!
//! Arbitrary header bytes must yield a credential, nothing, or a malformed
//! credential failure; never a panic.

#![no_main]

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use libfuzzer_sys::fuzz_target;
use turnstile::StaticTokenVerifier;
use turnstile::middleware::AuthGate;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = HeaderValue::from_bytes(data) else {
        return;
    };
    let mut headers = HeaderMap::new();
    headers.insert("authorization", value);

    let gate = AuthGate::required(Arc::new(StaticTokenVerifier::new()));
    if let Ok(Some(credential)) = gate.extract_credential(&headers) {
        assert!(data.len() >= credential.len());
    }

    let raw = AuthGate::required(Arc::new(StaticTokenVerifier::new())).token_prefix("");
    let _ = raw.extract_credential(&headers);
});
