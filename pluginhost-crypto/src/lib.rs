//! CSPRNG-backed id/token generation and constant-time comparison.
//!
//! These are leaf utilities: no locking, no I/O beyond the OS random source.
//! Every generator surfaces CSPRNG failure as an error rather than panicking
//! or silently falling back to a weaker source.

use rand::rngs::OsRng;
use rand::RngCore;

/// A failure reading from the operating system's CSPRNG.
///
/// This should be exceedingly rare in practice (it indicates the OS entropy
/// source itself is unavailable) but callers at the RPC boundary must map it
/// to an internal-error kind rather than unwrap through it.
#[derive(Debug)]
pub struct CsprngError(pub String);

impl std::fmt::Display for CsprngError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CSPRNG failure: {}", self.0)
    }
}

impl std::error::Error for CsprngError {}

fn random_bytes(n: usize) -> Result<Vec<u8>, CsprngError> {
    let mut buf = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CsprngError(e.to_string()))?;
    Ok(buf)
}

/// Lowercase `id`, collapsing every run of non-alphanumeric characters into a
/// single `-`, and trim leading/trailing `-`. Used to normalize a plugin's
/// self-chosen label before it becomes part of a `runtime_id`.
pub fn normalize_label(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    let mut last_was_sep = false;
    for ch in id.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('-');
            last_was_sep = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Generate an 8+ character lowercase-hex CSPRNG nonce (4 random bytes).
pub fn hex_nonce() -> Result<String, CsprngError> {
    let bytes = random_bytes(4)?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

/// Derive a `runtime_id` from a normalized self-id label plus a fresh CSPRNG
/// suffix: `{normalized}-{nonce}`, or just `{nonce}` if the label is empty.
pub fn derive_runtime_id(normalized_label: &str) -> Result<String, CsprngError> {
    let nonce = hex_nonce()?;
    if normalized_label.is_empty() {
        Ok(nonce)
    } else {
        Ok(format!("{normalized_label}-{nonce}"))
    }
}

/// Generate a 256-bit (32 byte) CSPRNG token, base64url (no padding) encoded.
pub fn random_token() -> Result<String, CsprngError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let bytes = random_bytes(32)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate a CSPRNG id suitable for `registration_id` / `grant_id` (16 random
/// bytes, base64url encoded — shorter than a runtime token, not meant as a
/// secret, just a unique handle).
pub fn random_id() -> Result<String, CsprngError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let bytes = random_bytes(16)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Constant-time equality check for secret comparison (tokens, bearer values,
/// magic cookies).
///
/// Length is checked first — a length mismatch is already a cheap, already
/// public signal — then the equal-length case is compared byte-for-byte in
/// constant time via `subtle`, never branching on the content.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
