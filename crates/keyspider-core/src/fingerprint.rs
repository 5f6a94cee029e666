//! Public key parsing and fingerprint calculation.
//!
//! Accepts `authorized_keys`-style lines (with an optional options prefix),
//! bare base64 bodies, and PEM blocks. Fingerprints are computed over the
//! decoded wire-format blob: SHA256 rendered as `SHA256:<base64-no-pad>`,
//! MD5 as `MD5:aa:bb:…`.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use md5::Md5;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::KeyType;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Malformed key: {0}")]
    MalformedKey(String),
}

type Result<T> = std::result::Result<T, FingerprintError>;

/// A parsed public key line.
#[derive(Debug, Clone)]
pub struct ParsedKey {
    pub key_type: KeyType,
    /// The literal type token, e.g. `ecdsa-sha2-nistp256`.
    pub type_token: String,
    /// Decoded wire-format blob the fingerprints are computed over.
    pub key_blob: Vec<u8>,
    /// The base64 body as it appeared on the line.
    pub body_b64: String,
    pub comment: Option<String>,
    /// Raw options prefix (`command="…",from="…"`), if any.
    pub options: Option<String>,
}

impl ParsedKey {
    /// `SHA256:` + unpadded base64 of the SHA-256 digest of the blob.
    pub fn sha256_fingerprint(&self) -> String {
        sha256_of_blob(&self.key_blob)
    }

    /// `MD5:` + colon-separated lowercase hex pairs.
    pub fn md5_fingerprint(&self) -> String {
        md5_of_blob(&self.key_blob)
    }

    /// Key size in bits, recovered from the wire format where cheap.
    ///
    /// RSA/DSA from the modulus/prime mpint, Ed25519 fixed at 256, ECDSA
    /// from the curve name in the type token.
    pub fn key_bits(&self) -> Option<u32> {
        match self.key_type {
            KeyType::Ed25519 => Some(256),
            KeyType::Ecdsa => match self.type_token.rsplit('-').next()? {
                "nistp256" => Some(256),
                "nistp384" => Some(384),
                "nistp521" => Some(521),
                _ => None,
            },
            KeyType::Rsa => {
                // blob = string type, mpint e, mpint n
                let mut off = 0;
                read_field(&self.key_blob, &mut off)?;
                read_field(&self.key_blob, &mut off)?;
                let n = read_field(&self.key_blob, &mut off)?;
                Some(mpint_bits(n))
            }
            KeyType::Dsa => {
                // blob = string type, mpint p, …
                let mut off = 0;
                read_field(&self.key_blob, &mut off)?;
                let p = read_field(&self.key_blob, &mut off)?;
                Some(mpint_bits(p))
            }
            KeyType::Unknown => None,
        }
    }
}

/// Parse a single public key line, stripping any options prefix.
///
/// `authorized_keys` lines may start with an options list whose quoted
/// values can contain whitespace (`command="/bin/backup two"`); splitting is
/// quote-aware so the type token is found reliably.
pub fn parse_public_key(line: &str) -> Result<ParsedKey> {
    let line = line.trim();
    if line.is_empty() {
        return Err(FingerprintError::MalformedKey("empty line".to_string()));
    }

    let tokens = split_quote_aware(line);
    let type_idx = tokens
        .iter()
        .position(|t| key_type_for(t).is_some())
        .ok_or_else(|| FingerprintError::MalformedKey("unknown key type prefix".to_string()))?;

    let type_token = tokens[type_idx].clone();
    let key_type = key_type_for(&type_token).unwrap_or(KeyType::Unknown);

    let body_b64 = tokens
        .get(type_idx + 1)
        .ok_or_else(|| FingerprintError::MalformedKey("missing key body".to_string()))?
        .clone();

    let key_blob = STANDARD
        .decode(body_b64.as_bytes())
        .map_err(|e| FingerprintError::MalformedKey(format!("invalid base64 body: {e}")))?;

    let comment = if tokens.len() > type_idx + 2 {
        Some(tokens[type_idx + 2..].join(" "))
    } else {
        None
    };

    let options = if type_idx > 0 {
        Some(tokens[..type_idx].join(" "))
    } else {
        None
    };

    Ok(ParsedKey {
        key_type,
        type_token,
        key_blob,
        body_b64,
        comment,
        options,
    })
}

/// SHA256 fingerprint from arbitrary public key input: a full line, a bare
/// base64 body, or a PEM block. `None` when nothing decodable is found.
pub fn sha256_of_key_data(input: &str) -> Option<String> {
    let blob = extract_key_blob(input)?;
    Some(sha256_of_blob(&blob))
}

/// MD5 fingerprint from arbitrary public key input.
pub fn md5_of_key_data(input: &str) -> Option<String> {
    let blob = extract_key_blob(input)?;
    Some(md5_of_blob(&blob))
}

/// Key type from arbitrary public key input, if a type token is present.
pub fn key_type_of(input: &str) -> Option<KeyType> {
    let tokens = split_quote_aware(input.trim());
    tokens.iter().find_map(|t| key_type_for(t))
}

/// Normalise a fingerprint string into its canonical prefixed form.
///
/// SHA256 fingerprints lose base64 padding; MD5 hex is lowercased. The
/// transformation is idempotent.
pub fn normalize_fingerprint(fp: &str) -> String {
    let fp = fp.trim();
    if let Some(rest) = fp.strip_prefix("SHA256:") {
        return format!("SHA256:{}", rest.trim_end_matches('='));
    }
    if let Some(rest) = fp.strip_prefix("MD5:") {
        return format!("MD5:{}", rest.to_ascii_lowercase());
    }
    if looks_like_md5_hex(fp) {
        format!("MD5:{}", fp.to_ascii_lowercase())
    } else {
        format!("SHA256:{}", fp.trim_end_matches('='))
    }
}

/// Compare two fingerprints across formats.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    normalize_fingerprint(a) == normalize_fingerprint(b)
}

fn key_type_for(token: &str) -> Option<KeyType> {
    match token {
        "ssh-rsa" => Some(KeyType::Rsa),
        "ssh-ed25519" => Some(KeyType::Ed25519),
        "ssh-dss" => Some(KeyType::Dsa),
        t if t.starts_with("ecdsa-sha2-") => Some(KeyType::Ecdsa),
        _ => None,
    }
}

fn sha256_of_blob(blob: &[u8]) -> String {
    let digest = Sha256::digest(blob);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

fn md5_of_blob(blob: &[u8]) -> String {
    let digest = Md5::digest(blob);
    let hex: Vec<String> = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("MD5:{}", hex.join(":"))
}

/// Extract the base64 blob from a key line, a PEM block, or bare base64.
fn extract_key_blob(input: &str) -> Option<Vec<u8>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(parsed) = parse_public_key(input) {
        return Some(parsed.key_blob);
    }

    if input.starts_with("-----") {
        let body: String = input
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect::<Vec<_>>()
            .join("");
        return STANDARD.decode(body.as_bytes()).ok();
    }

    if input
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
    {
        return STANDARD.decode(input.as_bytes()).ok();
    }

    None
}

/// Split on whitespace outside double quotes; backslash escapes inside
/// quotes are preserved verbatim.
fn split_quote_aware(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '\\' if in_quotes => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn looks_like_md5_hex(s: &str) -> bool {
    let segments: Vec<&str> = s.split(':').collect();
    segments.len() == 16
        && segments
            .iter()
            .all(|seg| seg.len() == 2 && seg.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn read_field<'a>(buf: &'a [u8], off: &mut usize) -> Option<&'a [u8]> {
    let len_bytes = buf.get(*off..*off + 4)?;
    let len = u32::from_be_bytes(len_bytes.try_into().ok()?) as usize;
    *off += 4;
    let field = buf.get(*off..*off + len)?;
    *off += len;
    Some(field)
}

/// Bit length of an ssh mpint (big-endian, possibly zero-padded).
fn mpint_bits(bytes: &[u8]) -> u32 {
    let mut i = 0;
    while i < bytes.len() && bytes[i] == 0 {
        i += 1;
    }
    let rest = &bytes[i..];
    match rest.first() {
        None => 0,
        Some(&first) => rest.len() as u32 * 8 - first.leading_zeros(),
    }
}
