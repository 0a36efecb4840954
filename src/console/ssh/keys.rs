//! Host key and authorized key material.
//!
//! Keys are supplied as text; reading them from disk is left to the caller.

use russh::keys::{PrivateKey, PublicKey};

use crate::console::error::ConsoleError;

/// Decode an OpenSSH or PEM private key, optionally encrypted.
pub fn parse_host_key(text: &str, passphrase: Option<&str>) -> Result<PrivateKey, ConsoleError> {
    russh::keys::decode_secret_key(text, passphrase)
        .map_err(|e| ConsoleError::Key(format!("failed to decode host key: {e}")))
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-")
        || token.starts_with("ecdsa-sha2-")
        || token.starts_with("sk-ssh-")
        || token.starts_with("sk-ecdsa-")
}

/// Parse one `authorized_keys` line into a public key.
///
/// Leading options (`from="..."`, `no-pty`) are skipped by locating the key
/// type token; the base64 blob follows it.
pub fn parse_authorized_key(line: &str) -> Result<PublicKey, ConsoleError> {
    let mut tokens = line.split_whitespace();
    tokens
        .by_ref()
        .find(|token| is_key_type(token))
        .ok_or_else(|| ConsoleError::Key(format!("invalid authorized_key format: {line}")))?;
    let blob = tokens
        .next()
        .ok_or_else(|| ConsoleError::Key(format!("missing key data: {line}")))?;

    russh::keys::parse_public_key_base64(blob)
        .map_err(|e| ConsoleError::Key(format!("failed to parse public key: {e}")))
}

/// Parse the text of an `authorized_keys` file.
///
/// Blank lines and `#` comments are skipped. Any other line that does not
/// parse fails the whole file.
pub fn parse_authorized_keys(text: &str) -> Result<Vec<PublicKey>, ConsoleError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_authorized_key)
        .collect()
}
