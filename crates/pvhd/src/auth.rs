//! Authorization of privileged control requests.
//!
//! The gateway only checks that a token is well formed; whether it grants
//! access is up to an [`Authorizer`].

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Longest accepted token.
pub const MAX_TOKEN_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Token is empty")]
    Empty,

    #[error("Token longer than {MAX_TOKEN_LEN} characters")]
    TooLong,

    #[error("Token contains non-printable or non-ASCII characters")]
    InvalidCharacters,
}

/// Non-empty, at most [`MAX_TOKEN_LEN`] printable ASCII characters.
pub fn validate_token_shape(token: &str) -> Result<(), TokenError> {
    if token.is_empty() {
        return Err(TokenError::Empty);
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(TokenError::TooLong);
    }
    if !token.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(TokenError::InvalidCharacters);
    }
    Ok(())
}

/// Decides whether a well-formed token grants privileged access.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: &str) -> bool;
}

/// Accepts tokens whose SHA-256 digest is configured. Denies everything when
/// no digests are configured.
#[derive(Debug, Clone, Default)]
pub struct DigestAuthorizer {
    digests: Vec<String>,
}

impl DigestAuthorizer {
    /// Digests are hex strings; case is ignored.
    pub fn new(digests: impl IntoIterator<Item = String>) -> Self {
        Self {
            digests: digests
                .into_iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_deny_all(&self) -> bool {
        self.digests.is_empty()
    }
}

impl Authorizer for DigestAuthorizer {
    fn authorize(&self, token: &str) -> bool {
        if self.digests.is_empty() {
            return false;
        }
        let digest = sha256_hex(token);
        self.digests.iter().any(|d| *d == digest)
    }
}

/// Lowercase hex SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        assert_eq!(validate_token_shape(""), Err(TokenError::Empty));
        assert_eq!(
            validate_token_shape(&"a".repeat(MAX_TOKEN_LEN + 1)),
            Err(TokenError::TooLong)
        );
        assert_eq!(
            validate_token_shape("tab\there"),
            Err(TokenError::InvalidCharacters)
        );
        assert_eq!(
            validate_token_shape("grüße"),
            Err(TokenError::InvalidCharacters)
        );
        assert!(validate_token_shape(&"a".repeat(MAX_TOKEN_LEN)).is_ok());
        assert!(validate_token_shape("operator token 1").is_ok());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_authorizer() {
        let auth = DigestAuthorizer::new(vec![sha256_hex("secret").to_ascii_uppercase()]);
        assert!(auth.authorize("secret"));
        assert!(!auth.authorize("guess"));
    }

    #[test]
    fn test_no_digests_denies_all() {
        let auth = DigestAuthorizer::new(Vec::new());
        assert!(auth.is_deny_all());
        assert!(!auth.authorize("anything"));
    }
}
