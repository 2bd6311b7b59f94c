//! Random identifiers
//!
//! Short ids used to correlate log lines belonging to one request or socket.

use rand::Rng;

/// Alphabet used for generated strings
pub const DEFAULT_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length of ids generated for logging
pub const LOGGING_ID_LENGTH: usize = 6;

/// Generate a random string of `length` characters picked from `alphabet`
pub fn generate_random_string(length: usize, alphabet: &str) -> String {
    let chars: Vec<char> = alphabet.chars().collect();
    if chars.is_empty() {
        return String::new();
    }

    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect()
}

/// Generate a random id for logging purposes
pub fn generate_logging_id() -> String {
    generate_random_string(LOGGING_ID_LENGTH, DEFAULT_ALPHABET)
}
