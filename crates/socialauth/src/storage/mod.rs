//! Storage interfaces consumed by the authentication core.
//!
//! This module defines storage interfaces for:
//!
//! - One-time OIDC nonces ([`NonceStore`])
//! - Suspended pipeline runs ([`PartialStore`])
//! - Local users and their linked social accounts ([`UserStore`])
//! - The per-browser session owned by the web framework ([`Session`])
//!
//! # Implementations
//!
//! Storage implementations are provided in separate crates:
//!
//! - `socialauth-memory` - in-memory backend for tests and single-process use

pub mod nonce;
pub mod partial;
pub mod session;
pub mod user;

pub use nonce::{Nonce, NonceStore};
pub use partial::{PartialState, PartialStore, SocialRef};
pub use session::Session;
pub use user::{NewUser, SocialAccount, User, UserStore, clean_username};
