//! Session identifiers: random base62 strings drawn from the OS RNG.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::MIN_SESSION_ID_LENGTH;
use crate::errors::{Error, Result};

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

// Largest multiple of 62 that fits in a byte; higher bytes are rejected so
// every symbol is equally likely.
const REJECTION_LIMIT: u8 = 248;

/// A random base62 string of `length` symbols.
pub fn random_base62(length: usize) -> Result<String> {
    if length < MIN_SESSION_ID_LENGTH {
        return Err(Error::id_generation(format!(
            "session ids need at least {} symbols, got {}",
            MIN_SESSION_ID_LENGTH, length
        )));
    }

    let mut id = String::with_capacity(length);
    let mut buf = [0u8; 64];
    while id.len() < length {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| Error::id_generation(format!("entropy source failed: {}", e)))?;

        for byte in buf.iter().copied().filter(|b| *b < REJECTION_LIMIT) {
            id.push(ALPHABET[(byte % 62) as usize] as char);
            if id.len() == length {
                break;
            }
        }
    }
    Ok(id)
}

/// A fresh identifier for which `is_taken` is false.
///
/// Gives up with [`Error::IdGeneration`] after `max_attempts` collisions.
pub fn unique_session_id<F>(length: usize, max_attempts: u32, is_taken: F) -> Result<String>
where
    F: Fn(&str) -> bool,
{
    for _ in 0..max_attempts.max(1) {
        let candidate = random_base62(length)?;
        if !is_taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::id_generation(format!(
        "no unique session id after {} attempts",
        max_attempts.max(1)
    )))
}
