// src/signature.rs

//! HMAC-SHA256 verification of inbound webhook bodies.
//!
//! The sender signs the exact request bytes and sends the base64 digest in a
//! header. Verification must run over the raw body, never a re-serialized
//! JSON value.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn digest(&self, body: &[u8]) -> Vec<u8> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }

    /// Base64 signature for `body`, in the same format the sender uses.
    pub fn sign(&self, body: &[u8]) -> String {
        BASE64.encode(self.digest(body))
    }

    /// Returns true only when `signature` is the base64 HMAC of `body`.
    ///
    /// Malformed base64 and wrong-length digests are rejected before the
    /// constant-time comparison; neither leaks anything about the secret.
    pub fn verify(&self, body: &[u8], signature: &str) -> bool {
        let Ok(received) = BASE64.decode(signature.trim()) else {
            return false;
        };
        if received.len() != 32 {
            return false;
        }
        let expected = self.digest(body);
        expected.as_slice().ct_eq(received.as_slice()).into()
    }
}
