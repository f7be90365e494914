//! In-memory storage backend for socialauth.
//!
//! This crate implements every storage trait of `socialauth` on top of
//! [`dashmap`], plus a [`MemorySession`] standing in for a web framework
//! session. Data lives as long as the store and is never shared between
//! processes, so it suits tests and single-process deployments.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use socialauth::SocialAuthService;
//! use socialauth_memory::{MemoryPartialStore, MemoryUserStore};
//!
//! let service = SocialAuthService::new(
//!     settings,
//!     Arc::new(MemoryUserStore::new()),
//!     Arc::new(MemoryPartialStore::new()),
//! )?;
//! ```

pub mod nonce;
pub mod partial;
pub mod session;
pub mod user;

pub use nonce::MemoryNonceStore;
pub use partial::MemoryPartialStore;
pub use session::MemorySession;
pub use user::MemoryUserStore;
