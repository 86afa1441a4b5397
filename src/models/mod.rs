//! Persisted record types
//!
//! Every durable shape has a tagged Rust type with an explicit `FromRow`
//! constructor; rows and serialized values never travel as loose maps.

pub mod role;
pub mod session;
pub mod user;

pub use role::{RoleGrant, UserRole};
pub use session::Session;
pub use user::User;
