//! Hashing de credenciales con sal sobre SHA-256.
//!
//! Formato almacenado: `s256$<sal>$<digest-hex>`. La verificación recomputa
//! con la sal embebida y compara en tiempo acotado por longitud fija.

use crm_core::actions::CredentialHasher;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub struct SaltedSha256Hasher;

impl SaltedSha256Hasher {
    pub fn new() -> Self {
        Self
    }

    fn digest(salt: &str, plain: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(b"$");
        hasher.update(plain.as_bytes());
        let out = hasher.finalize();
        out.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl CredentialHasher for SaltedSha256Hasher {
    fn hash(&self, plain: &str) -> String {
        let salt = Uuid::new_v4().simple().to_string();
        format!("s256${salt}${}", Self::digest(&salt, plain))
    }

    fn verify(&self, plain: &str, hashed: &str) -> bool {
        let mut parts = hashed.splitn(3, '$');
        let (scheme, salt, digest) = match (parts.next(), parts.next(), parts.next()) {
            (Some(scheme), Some(salt), Some(digest)) => (scheme, salt, digest),
            _ => return false,
        };
        if scheme != "s256" {
            return false;
        }
        let computed = Self::digest(salt, plain);
        // Comparación byte a byte sin cortocircuito.
        computed.len() == digest.len()
        && computed.bytes().zip(digest.bytes()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hasher = SaltedSha256Hasher::new();
        let stored = hasher.hash("SecurePass123!");
        assert!(stored.starts_with("s256$"));
        assert_ne!(stored, "SecurePass123!");
        assert!(hasher.verify("SecurePass123!", &stored));
        assert!(!hasher.verify("WrongPass", &stored));
        assert!(!hasher.verify("SecurePass123!", "garbage"));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let hasher = SaltedSha256Hasher::new();
        assert_ne!(hasher.hash("same"), hasher.hash("same"));
    }
}
