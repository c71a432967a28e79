#![forbid(unsafe_code)]

//! Document-store contract and the chat core's data-access components.
//!
//! The chat core depends on exactly the primitives declared here: document
//! create/read/update where a single update call applies its operations
//! atomically (set, array-union, array-remove, atomic increment, field
//! delete), plus query-by-field with order-by and limit. Concurrently
//! mutated fields — room membership, ban lists, pinned sets, message
//! counters, reaction arrays — are only ever touched through these
//! operations, never read-modify-write.

pub mod doc;
pub mod messages;
pub mod presence;
pub mod rooms;

pub use doc::{DocumentStore, Filter, MemStore, Order, Query, StoreError, UpdateOp};
pub use messages::{MessageDoc, MessageLog, ReactionDoc, ReadReceiptDoc, ReportDoc};
pub use presence::{PresenceStore, UserRecord};
pub use rooms::{MemberMeta, RoomDoc, RoomPage, RoomRegistry};
