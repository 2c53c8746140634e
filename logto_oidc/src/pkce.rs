//! Proof Key for Code Exchange (RFC 7636) and `state` generation
//!
//! Every value produced here is 32 bytes of operating-system randomness, encoded as
//! URL-safe base64 without padding, which always yields 43 characters.

use aliri_base64::Base64Url;
use rand::{rngs::OsRng, RngCore};

use crate::{CodeVerifier, CodeVerifierRef};

const RANDOM_BYTES: usize = 32;

fn random_url_safe() -> String {
    let mut buf = [0u8; RANDOM_BYTES];
    OsRng.fill_bytes(&mut buf);
    Base64Url::from_raw(buf.to_vec()).to_string()
}

/// Generates an opaque `state` value binding an authorization request to its callback
pub fn generate_state() -> String {
    random_url_safe()
}

/// Generates a fresh PKCE code verifier
pub fn generate_code_verifier() -> CodeVerifier {
    CodeVerifier::new(random_url_safe())
}

/// Derives the `S256` code challenge for a verifier
///
/// The challenge is the SHA-256 digest of the verifier's bytes, encoded as URL-safe
/// base64 without padding.
pub fn generate_code_challenge(verifier: &CodeVerifierRef) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, verifier.as_str().as_bytes());
    Base64Url::from_raw(digest.as_ref().to_vec()).to_string()
}

/// The only code challenge method this crate emits
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// A source of the random values needed to start a sign-in
///
/// Production code uses [`RandomProofs`]; tests can substitute a fixed source to
/// obtain predictable authorization URLs.
pub trait ProofSource: Send + Sync + std::fmt::Debug {
    /// Produces a new `state` value
    fn state(&self) -> String;

    /// Produces a new code verifier
    fn code_verifier(&self) -> CodeVerifier;
}

/// A proof source backed by the operating system's secure random number generator
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomProofs;

impl ProofSource for RandomProofs {
    fn state(&self) -> String {
        generate_state()
    }

    fn code_verifier(&self) -> CodeVerifier {
        generate_code_verifier()
    }
}
