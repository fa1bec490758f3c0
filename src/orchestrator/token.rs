//! Random fixed-length tokens for sessions, blocks, and lock fencing.

use rand::Rng;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of session and block tokens.
pub const TOKEN_LEN: usize = 15;

/// Length of lock tokens.
pub const LOCK_TOKEN_LEN: usize = 7;

/// Generate a token of `len` alphanumeric characters.
#[must_use]
pub fn generate(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..TOKEN_ALPHABET.len());
            char::from(TOKEN_ALPHABET[idx])
        })
        .collect()
}

/// New session or block token.
#[must_use]
pub fn block_token() -> String {
    generate(TOKEN_LEN)
}

/// New lock token.
#[must_use]
pub fn lock_token() -> String {
    generate(LOCK_TOKEN_LEN)
}
