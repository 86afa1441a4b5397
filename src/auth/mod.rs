//! Authentication core
//!
//! Password policy and hashing ([`password`]), token minting and
//! verification ([`tokens`], [`jwks`]), session families with rotation and
//! reuse detection ([`sessions`]), role and permission resolution
//! ([`roles`]), the audit trail ([`audit`]), and the service that ties
//! them together ([`service`]).

pub mod audit;
pub mod jwks;
pub mod password;
pub mod roles;
pub mod service;
pub mod sessions;
pub mod tokens;

pub use service::AuthService;
pub use sessions::SessionStore;
pub use tokens::{Claims, TokenKind, TokenManager};
