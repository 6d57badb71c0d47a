//! Worker identities and generation tokens

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 128-bit token distinguishing successive processes of one logical worker.
///
/// The all-zero token identifies the first generation; every restart
/// announces a freshly generated, non-zero token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GenerationToken(pub Uuid);

impl GenerationToken {
    /// Wire size of a token
    pub const LEN: usize = 16;

    /// The first-generation token
    pub const fn first() -> Self {
        GenerationToken(Uuid::nil())
    }

    /// Generate a token for a new worker generation
    pub fn generate() -> Self {
        GenerationToken(Uuid::new_v4())
    }

    /// Check if this is the first-generation (all-zero) token
    pub fn is_first(&self) -> bool {
        self.0.is_nil()
    }

    /// Big-endian wire representation
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        *self.0.as_bytes()
    }

    /// Build a token from its wire representation
    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        GenerationToken(Uuid::from_bytes(bytes))
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for GenerationToken {
    fn from(uuid: Uuid) -> Self {
        GenerationToken(uuid)
    }
}

/// Identity of one logical worker slot and its current process generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub index: usize,
    pub generation: GenerationToken,
}

impl WorkerIdentity {
    pub fn new(index: usize, generation: GenerationToken) -> Self {
        Self { index, generation }
    }

    /// Identity of a first-generation worker
    pub fn first_generation(index: usize) -> Self {
        Self::new(index, GenerationToken::first())
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generation.is_first() {
            write!(f, "worker-{}", self.index)
        } else {
            write!(f, "worker-{} ({})", self.index, self.generation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_generation_token() {
        let token = GenerationToken::first();
        assert!(token.is_first());
        assert_eq!(token.to_bytes(), [0u8; 16]);
        assert_eq!(token, GenerationToken::default());
    }

    #[test]
    fn test_generated_token_bytes() {
        let token = GenerationToken::generate();
        assert!(!token.is_first());
        assert_eq!(GenerationToken::from_bytes(token.to_bytes()), token);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(WorkerIdentity::first_generation(3).to_string(), "worker-3");
        let restarted = WorkerIdentity::new(1, GenerationToken::generate());
        assert!(restarted.to_string().starts_with("worker-1 ("));
    }
}
