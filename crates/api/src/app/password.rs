//! bcrypt password hashing.

pub use bcrypt::BcryptError;

/// Work factor for stored hashes.
pub const DEFAULT_COST: u32 = bcrypt::DEFAULT_COST;

/// Cheapest factor bcrypt accepts; for tests only.
pub const MIN_COST: u32 = 4;

/// Hash `password` with a fresh salt. Output is the standard `$2b$` form.
pub fn hash_password(password: &str, cost: u32) -> Result<String, BcryptError> {
    bcrypt::hash(password, cost)
}

/// Whether `password` matches a value produced by [`hash_password`].
/// Malformed hashes never match.
pub fn check_password(password: &str, hashed: &str) -> bool {
    bcrypt::verify(password, hashed).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_and_is_salted() {
        let a = hash_password("secret123", MIN_COST).unwrap();
        let b = hash_password("secret123", MIN_COST).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("$2b$04$"));
        assert!(check_password("secret123", &a));
        assert!(check_password("secret123", &b));
        assert!(!check_password("secret124", &a));
    }

    #[test]
    fn malformed_hashes_never_match() {
        assert!(!check_password("x", ""));
        assert!(!check_password("x", "md5$00$00"));
        assert!(!check_password("x", "$2b$04$tooshort"));
    }

    #[test]
    fn out_of_range_cost_is_an_error() {
        assert!(hash_password("secret123", MIN_COST - 1).is_err());
    }
}
