//! Cryptographic utilities for the blockchain
//!
//! SHA-256 hashing and the 256-bit hash type.

pub mod hash;

pub use hash::{double_sha256, meets_difficulty, sha256, Hash256, HASH_SIZE};
