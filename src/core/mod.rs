//! Engine internals
//!
//! - [`store`] - SQLite store, transactions and row access
//! - [`lock`] - transaction-scoped advisory locks
//! - [`prefix`] - prefix store and first-fit carving
//! - [`ipam`] - IP Block level prefix operations
//! - [`admission`] - Instance Type capacity checks
//! - [`notifier`] - orchestration workflows and the outbox
//! - [`engine`] - the allocation engine itself

pub mod admission;
pub mod engine;
pub mod inventory;
pub mod ipam;
pub mod lock;
pub mod model;
pub mod notifier;
pub mod prefix;
pub mod store;
pub mod validation;
