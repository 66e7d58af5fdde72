//! Entity ID generation
//!
//! All IDs use the format `{kind}_{12-char-hex}`, e.g. `run_0194f3a2b6c1`.
//! The hex portion comes from a v7 UUID, so IDs of a kind sort roughly
//! by creation time.

/// Generate an ID for an entity kind
pub fn generate_id(kind: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    format!("{}_{}", kind, &uuid[..12])
}
