//! Generic reusable functions that do not rely on project specific resources.

pub mod errors;
pub mod log;

use chrono::Utc;

const TOKEN_NOISE_LEN: usize = 6;
const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a `<unix_millis>-<noise>` token that is unique enough for
/// write identification within a browsing session.
/// The noise component breaks ties between writes in the same millisecond.
pub fn unique_token() -> String {
    let millis = Utc::now().timestamp_millis();
    let noise = (0..TOKEN_NOISE_LEN)
        .map(|_| {
            let roll = js_sys::Math::random() * TOKEN_ALPHABET.len() as f64;
            TOKEN_ALPHABET[(roll as usize).min(TOKEN_ALPHABET.len() - 1)] as char
        })
        .collect::<String>();
    format!("{millis}-{noise}")
}
