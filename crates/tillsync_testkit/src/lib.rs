//! # TillSync Testkit
//!
//! Test utilities for TillSync.
//!
//! This crate provides:
//! - Engine fixtures (manual clock, in-memory repositories, memory audit log)
//! - Property-based test generators using proptest
//! - A server harness with drainable real-time connections
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tillsync_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_engine() {
//!     with_pos_engine(|t| {
//!         t.seed("Product", "p1", serde_json::json!({"name": "Tea"}));
//!         // ... sync operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
