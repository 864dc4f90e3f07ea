use crate::error::PasswordError;

// bcrypt keeps its cost bounds private; these mirror bcrypt 0.15's values.

/// Lowest work factor bcrypt accepts. Only for throwaway clusters.
pub const MIN_COST: u32 = 4;

/// Highest work factor bcrypt accepts.
pub const MAX_COST: u32 = 31;

/// Opaque password digest service. Digests are replicated verbatim, so a
/// cluster must use the same hasher on every node.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<Vec<u8>, PasswordError>;
    fn verify(&self, digest: &[u8], password: &str) -> bool;
}

/// bcrypt with a fixed work factor. The digest is the modular-crypt string,
/// which carries its own salt and cost, so nodes configured with different
/// costs still verify each other's digests.
#[derive(Clone, Copy, Debug)]
pub struct Bcrypt {
    cost: u32,
}

impl Bcrypt {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }
}

impl Default for Bcrypt {
    fn default() -> Self {
        Self::new(bcrypt::DEFAULT_COST)
    }
}

impl PasswordHasher for Bcrypt {
    fn hash(&self, password: &str) -> Result<Vec<u8>, PasswordError> {
        Ok(bcrypt::hash(password, self.cost)?.into_bytes())
    }

    fn verify(&self, digest: &[u8], password: &str) -> bool {
        let Ok(digest) = std::str::from_utf8(digest) else {
            return false;
        };
        bcrypt::verify(password, digest).unwrap_or(false)
    }
}
