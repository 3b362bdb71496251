//! Admin authentication gate.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Yes/no check for the admin slot.
pub trait AdminGate: Send {
    fn authorize(&self, credential: &str) -> bool;
}

/// Compares SHA-256 digests of a configured secret and the credential.
///
/// An empty configured secret authorizes nobody.
pub struct SharedSecretGate {
    digest: Option<[u8; 32]>,
}

impl SharedSecretGate {
    pub fn new(secret: &str) -> Self {
        let digest = (!secret.is_empty()).then(|| Sha256::digest(secret.as_bytes()).into());
        Self { digest }
    }
}

impl AdminGate for SharedSecretGate {
    fn authorize(&self, credential: &str) -> bool {
        let Some(expected) = &self.digest else {
            return false;
        };
        let presented: [u8; 32] = Sha256::digest(credential.as_bytes()).into();
        bool::from(expected.as_slice().ct_eq(presented.as_slice()))
    }
}
