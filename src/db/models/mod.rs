//! Database models split into domain-specific modules.

pub mod conversation;
pub mod notification;
pub mod user;

pub use conversation::*;
pub use notification::*;
pub use user::*;
