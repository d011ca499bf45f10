//! UUID utilities

use uuid::Uuid;

/// Generate a new UUIDv4 in its stored (hyphenated string) form
pub fn generate_string() -> String {
    Uuid::new_v4().to_string()
}
