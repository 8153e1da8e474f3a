#![forbid(unsafe_code)]

// Room join passwords, stored as argon2 hashes

use crate::error::{RelayError, RelayResult};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

pub const MAX_PASSWORD_LEN: usize = 128;

pub fn hash_password(password: &str) -> RelayResult<String> {
    if password.is_empty() || password.len() > MAX_PASSWORD_LEN {
        return Err(RelayError::Validation(format!(
            "Room password must be 1-{MAX_PASSWORD_LEN} bytes"
        )));
    }
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| RelayError::Internal(format!("password hashing failed: {e}")))
}

/// Check a join attempt against a stored hash. A missing password never
/// matches.
pub fn verify_password(password: Option<&str>, hash: &str) -> RelayResult<()> {
    let Some(password) = password else {
        return Err(RelayError::Forbidden("room password required".into()));
    };
    let parsed = PasswordHash::new(hash)
        .map_err(|e| RelayError::Internal(format!("stored password hash is corrupt: {e}")))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(()),
        Err(argon2::password_hash::Error::Password) => {
            Err(RelayError::Forbidden("wrong room password".into()))
        }
        Err(e) => Err(RelayError::Internal(format!("password check failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("correct-horse-battery-staple").unwrap();
        assert!(verify_password(Some("correct-horse-battery-staple"), &hash).is_ok());
        assert!(matches!(
            verify_password(Some("wrong-password"), &hash),
            Err(RelayError::Forbidden(_))
        ));
    }

    #[test]
    fn test_missing_password_is_forbidden() {
        let hash = hash_password("secret").unwrap();
        assert!(matches!(verify_password(None, &hash), Err(RelayError::Forbidden(_))));
    }

    #[test]
    fn test_salted_hashes_differ() {
        let hash1 = hash_password("password1").unwrap();
        let hash2 = hash_password("password1").unwrap();
        assert_ne!(hash1, hash2);
        assert!(verify_password(Some("password1"), &hash2).is_ok());
    }

    #[test]
    fn test_length_bounds() {
        assert!(matches!(hash_password(""), Err(RelayError::Validation(_))));
        let long = "x".repeat(MAX_PASSWORD_LEN + 1);
        assert!(matches!(hash_password(&long), Err(RelayError::Validation(_))));
    }
}
