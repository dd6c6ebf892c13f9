//! Tag Index Module
//!
//! In-memory mapping from tag name to a compressed set of object identifiers,
//! with change notification feeding the durability layer.
//!
//! # Components
//!
//! - **tag_index**: the lock-protected tag to bitmap map and its mutation API
//! - **notify**: non-blocking change signals posted by mutators

pub mod notify;
pub mod tag_index;

// Re-export main types
pub use notify::{ChangeNotifier, ChangeReceiver};
pub use tag_index::{deserialize_bitmap, serialize_bitmap, SerializedTag, TagIndex};
