//! UUID generation and the 8-hex "short ID" shown to humans.
//!
//! Short IDs are a UX affordance, not an identity: resolvers must detect
//! prefix collisions and surface every candidate.

use uuid::Uuid;

/// Length of the human-facing short ID (hex chars of the hyphen-free UUID).
pub const SHORT_ID_LEN: usize = 8;

pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// First 8 lowercase hex characters of the UUID with hyphens removed.
pub fn short_id(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    simple[..SHORT_ID_LEN].to_string()
}

/// True when `prefix` (lowercase hex, hyphen-free) prefixes the UUID.
pub fn matches_prefix(id: &Uuid, prefix: &str) -> bool {
    id.simple().to_string().starts_with(prefix)
}

/// Normalize user input for prefix lookup: lowercase, hyphens dropped.
/// Returns `None` when the input is not plausible hex.
pub fn normalize_prefix(input: &str) -> Option<String> {
    let cleaned: String = input
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if cleaned.is_empty() || cleaned.len() > 32 {
        return None;
    }
    cleaned
        .chars()
        .all(|c| c.is_ascii_hexdigit())
        .then_some(cleaned)
}
