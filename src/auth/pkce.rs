//! PKCE (RFC 7636) verifier, challenge, and state nonce generation.

use super::store::PendingAuthorization;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

const VERIFIER_BYTES: usize = 64;
const STATE_BYTES: usize = 16;

/// Fresh random verifier plus CSRF state for one authorization attempt.
///
/// The verifier never leaves this process; only [`challenge`](Self::challenge)
/// is sent to the authorization endpoint.
#[derive(Debug, Clone)]
pub struct PkceVerifier {
    verifier: String,
    state: String,
}

impl PkceVerifier {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();

        // 64 bytes encode to 86 characters, inside the 43..=128 range
        let mut verifier_bytes = [0u8; VERIFIER_BYTES];
        rng.fill_bytes(&mut verifier_bytes);

        let mut state_bytes = [0u8; STATE_BYTES];
        rng.fill_bytes(&mut state_bytes);

        Self {
            verifier: URL_SAFE_NO_PAD.encode(verifier_bytes),
            state: URL_SAFE_NO_PAD.encode(state_bytes),
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// S256 challenge: BASE64URL(SHA256(verifier))
    pub fn challenge(&self) -> String {
        code_challenge(&self.verifier)
    }

    pub fn into_pending(self) -> PendingAuthorization {
        PendingAuthorization {
            code_verifier: self.verifier,
            state: self.state,
        }
    }
}

pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7636_appendix_b_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_generated_values_are_url_safe_and_sized() {
        let pkce = PkceVerifier::generate();
        assert_eq!(pkce.verifier().len(), 86);
        assert!((43..=128).contains(&pkce.verifier().len()));
        let url_safe = |s: &str| {
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        };
        assert!(url_safe(pkce.verifier()));
        assert!(url_safe(pkce.state()));
        assert!(url_safe(&pkce.challenge()));
        assert!(!pkce.challenge().contains('='));
    }

    #[test]
    fn test_each_attempt_is_unique() {
        let a = PkceVerifier::generate();
        let b = PkceVerifier::generate();
        assert_ne!(a.verifier(), b.verifier());
        assert_ne!(a.state(), b.state());
    }
}
