#![deny(unused_must_use)]
#![deny(unreachable_patterns)]
#![deny(unknown_lints)]
//! # Hive Test Utilities
//!
//! Commonly useful utilities for testing the hive codebase.
//!
//! ## Modules
//!
//! - `address` - Hands out unique local endpoints for tests which bind sockets
//! - `futures` - Utilities which make testing future-based code easier
//! - `random` - Utilities for generating random values
//! - `streams` - Macros for collecting from async streams with timeouts

pub mod address;
pub mod futures;
pub mod random;
#[macro_use]
pub mod streams;
