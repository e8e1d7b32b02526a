//! ID generation helpers
//!
//! Operation ids are ULID-class: monotonically increasing and
//! timestamp-prefixed so they sort in creation order. `uuid`'s v7 variant
//! gives us that without pulling in a separate ULID crate.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Generate a new Operation id.
#[must_use]
pub fn new_operation_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generate a new opaque entity id (exports, restore mounts, snapshots).
#[must_use]
pub fn new_entity_id() -> String {
    Uuid::new_v4().to_string()
}

/// Derive a Backup Context id: `ctx-backup-<vm>-<ts>`.
#[must_use]
pub fn backup_context_id(vm_name: &str, created_at: u64) -> String {
    format!("ctx-backup-{vm_name}-{created_at}")
}

/// Current UTC time as Unix seconds.
#[must_use]
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_ids_are_unique_and_sortable() {
        let a = new_operation_id();
        let b = new_operation_id();
        assert_ne!(a, b);
    }

    #[test]
    fn backup_context_id_is_deterministic() {
        assert_eq!(
            backup_context_id("vm-a", 100),
            "ctx-backup-vm-a-100".to_string()
        );
    }
}
