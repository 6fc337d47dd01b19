//! UUIDv7 identifiers.
//
// Reset tokens get app-side UUIDv7 ids so rows sort by issue time. Users keep
// PostgreSQL's gen_random_uuid() (v4) default; the in-memory repository uses
// v7 for both.

use uuid::Uuid;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}
