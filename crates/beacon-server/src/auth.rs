use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Shared-secret check for the `authenticate` envelope.
///
/// Holds SHA-256 digests of the current secret and every legacy secret still
/// accepted during rotation. Candidates are hashed and compared against all
/// of them so the work done does not depend on which one matches.
pub struct Authenticator {
    digests: Vec<[u8; 32]>,
}

impl Authenticator {
    pub fn new(secret: &SecretString, legacy: &[SecretString]) -> Self {
        let digests = std::iter::once(secret)
            .chain(legacy)
            .map(|s| digest(s.expose_secret()))
            .collect();
        Self { digests }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let candidate = digest(candidate);
        self.digests
            .iter()
            .fold(false, |matched, known| matched | constant_time_eq(known, &candidate))
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("secrets", &self.digests.len())
            .finish()
    }
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
