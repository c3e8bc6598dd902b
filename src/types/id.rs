use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Derives a stable id for an object that lives under `parent`.
///
/// The id is the base64 encoding of `<parent>:<local>`, so it is the same on
/// every run and for every client that sees the same object.
pub fn derive_id(parent: &str, local: impl std::fmt::Display) -> String {
    STANDARD.encode(format!("{parent}:{local}"))
}
