//! Credential hashes.

use sha2::{Digest, Sha224};

/// Lowercase hex SHA-224 of `password`, the form users are keyed by.
///
/// ```
/// let hash = tunnel_auth::sha224_hex("password123");
/// assert_eq!(hash.len(), 56);
/// ```
pub fn sha224_hex(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

/// Whether `hash` is the credential hash of `password`. Hex case is ignored.
pub fn verify_password(password: &str, hash: &str) -> bool {
    sha224_hex(password).eq_ignore_ascii_case(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha224_known_vector() {
        assert_eq!(
            sha224_hex(""),
            "d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f"
        );
    }

    #[test]
    fn test_verify_password() {
        let hash = sha224_hex("test123");
        assert!(verify_password("test123", &hash));
        assert!(verify_password("test123", &hash.to_uppercase()));
        assert!(!verify_password("wrong", &hash));
    }
}
