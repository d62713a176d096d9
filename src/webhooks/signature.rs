//! Delivery authentication.

use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::SignatureMode;
use crate::errors::AuthenticationError;

type HmacSha256 = Hmac<Sha256>;

/// How a provider authenticates deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Hex HMAC-SHA256 of the raw body, optionally behind a prefix such as `sha256=`.
    Hmac {
        header: &'static str,
        prefix: Option<&'static str>,
    },
    /// The secret itself, echoed in a header.
    SharedSecret { header: &'static str },
}

impl SignatureScheme {
    /// Header carrying the signature or secret.
    pub fn header(&self) -> &'static str {
        match self {
            Self::Hmac { header, .. } | Self::SharedSecret { header } => header,
        }
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex HMAC-SHA256 signature in constant time.
pub fn verify_hmac(
    secret: &[u8],
    body: &[u8],
    signature_hex: &str,
    header: &str,
) -> Result<(), AuthenticationError> {
    let expected = hex::decode(signature_hex.trim()).map_err(|_| {
        AuthenticationError::MalformedSignature {
            header: header.to_string(),
        }
    })?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|_| AuthenticationError::MissingSecret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| AuthenticationError::SignatureMismatch)
}

/// Compare a presented shared secret in constant time.
pub fn verify_shared_secret(secret: &[u8], presented: &[u8]) -> Result<(), AuthenticationError> {
    if constant_time_eq(secret, presented) {
        Ok(())
    } else {
        Err(AuthenticationError::SignatureMismatch)
    }
}

/// Authenticate a delivery.
///
/// A missing header is accepted only under [`SignatureMode::UrlSecrecyOnly`].
/// A header that is present must always verify.
pub fn authenticate(
    scheme: SignatureScheme,
    headers: &HashMap<String, String>,
    body: &[u8],
    secret: Option<&[u8]>,
    mode: SignatureMode,
) -> Result<(), AuthenticationError> {
    let header = scheme.header();
    let presented = match headers.get(header) {
        Some(value) => value,
        None if mode == SignatureMode::UrlSecrecyOnly => {
            debug!(header, "Unsigned delivery accepted on URL secrecy");
            return Ok(());
        }
        None => {
            warn!(header, "Delivery missing signature header");
            return Err(AuthenticationError::MissingSignature {
                header: header.to_string(),
            });
        }
    };

    let secret = match secret {
        Some(secret) if !secret.is_empty() => secret,
        _ => {
            warn!(header, "Signed delivery received but no secret is provisioned");
            return Err(AuthenticationError::MissingSecret);
        }
    };

    let result = match scheme {
        SignatureScheme::Hmac { prefix, .. } => {
            let signature = match prefix {
                Some(prefix) => presented.trim().strip_prefix(prefix).ok_or_else(|| {
                    AuthenticationError::MalformedSignature {
                        header: header.to_string(),
                    }
                })?,
                None => presented.trim(),
            };
            verify_hmac(secret, body, signature, header)
        }
        SignatureScheme::SharedSecret { .. } => verify_shared_secret(secret, presented.as_bytes()),
    };

    match &result {
        Ok(()) => debug!(header, "Delivery signature verified"),
        Err(e) => warn!(header, error = %e, "Delivery signature verification failed"),
    }
    result
}
