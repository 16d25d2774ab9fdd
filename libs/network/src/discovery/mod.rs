//! Server Discovery
//!
//! Locates cache servers either through locators or from an explicit list.
//!
//! ```text
//! Pool ──select_server(excluded)──▶ ServerSelector ──LocatorRequest──▶ locator
//!                                        │
//!                                        └── round-robin over explicit servers
//! ```
//!
//! The locator list itself is refreshed periodically so clients keep finding
//! the cluster after locators are added or removed.

pub mod locator;
pub mod selector;

pub use locator::LocatorClient;
pub use selector::{ServerSelector, ServerSource};
