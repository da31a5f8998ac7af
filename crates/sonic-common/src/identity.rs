//! Mapping from arbitrary model names to identifiers that are safe to use in
//! cluster resource names and label keys.
//!
//! Identifiers match `[a-z0-9]([a-z0-9-]*[a-z0-9])?` and are at most
//! [`MAX_IDENTIFIER_LEN`] characters, so that `model.<identifier>` fits in a
//! Kubernetes label name. Encoding is deterministic but not injective: the
//! persisted registry in the controller is what makes decoding exact and
//! rejects collisions.

use sha2::{Digest, Sha256};

/// Upper bound on issued identifiers.
pub const MAX_IDENTIFIER_LEN: usize = 48;

/// Upper bound accepted from the label API (the resource-name limit).
pub const MAX_RESOURCE_NAME_LEN: usize = 63;

pub const MODEL_LABEL_PREFIX: &str = "model.";

const TRUNCATED_LEN: usize = 39;
const HASH_SUFFIX_LEN: usize = 8;

/// Encode a model name into a resource-safe identifier.
///
/// Lowercases, folds every run of characters outside `[a-z0-9]` into a single
/// hyphen and trims hyphens at both ends. Over-long results are cut and get a
/// hash of the full name appended; an empty result becomes `model-<hash>`.
pub fn encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(MAX_IDENTIFIER_LEN));
    let mut pending_hyphen = false;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    if out.is_empty() {
        return format!("model-{}", short_hash(name));
    }

    if out.len() > MAX_IDENTIFIER_LEN {
        // ascii only at this point, byte truncation is safe
        out.truncate(TRUNCATED_LEN);
        while out.ends_with('-') {
            out.pop();
        }
        out.push('-');
        out.push_str(&short_hash(name));
    }

    out
}

fn short_hash(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut hex = String::with_capacity(HASH_SUFFIX_LEN);
    for b in digest.iter().take(HASH_SUFFIX_LEN / 2) {
        hex.push_str(&format!("{b:02x}"));
    }
    hex
}

/// Check an identifier against the label-value grammar and resource-name length.
pub fn is_valid_identifier(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_RESOURCE_NAME_LEN {
        return false;
    }
    let bytes = id.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Label key marking that a pod hosts the model.
pub fn model_label_key(id: &str) -> String {
    format!("{MODEL_LABEL_PREFIX}{id}")
}

/// Inverse of [`model_label_key`]; `None` for unrelated or malformed keys.
pub fn parse_model_label_key(key: &str) -> Option<&str> {
    let id = key.strip_prefix(MODEL_LABEL_PREFIX)?;
    is_valid_identifier(id).then_some(id)
}
