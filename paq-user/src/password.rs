use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

// Argon2id, t=3, m=64 MiB, p=4, 16-byte salt, 32-byte tag.
const TIME_COST: u32 = 3;
const MEMORY_KIB: u32 = 64 * 1024;
const PARALLELISM: u32 = 4;
const OUTPUT_LEN: usize = 32;

fn argon2() -> Result<Argon2<'static>> {
    let params = Params::new(MEMORY_KIB, TIME_COST, PARALLELISM, Some(OUTPUT_LEN))
        .map_err(|e| anyhow!("Argon2 parameter error: {}", e))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(argon2()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("Argon2 error: {}", e))?
        .to_string())
}

/// Verification recomputes with the parameters carried in the encoded
/// string and compares in constant time (both done by the argon2 crate).
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow!("Invalid hashed password: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter3", &hash).unwrap());
    }

    #[test]
    fn encoded_parameters() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.contains("m=65536,t=3,p=4"));
    }

    #[test]
    fn rejects_garbage_hash() {
        assert!(verify_password("x", "not-a-phc-string").is_err());
    }
}
