pub mod enums;
pub mod message;

pub use enums::{Domain, MatchType, MessageStatus, SchemaVersion, Stage};
pub use message::*;
