//! Shared test utilities for engine, chaos and integration tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Scripted ChangeSource recording requests
//! - In-memory and recording journal stores
//! - A shared event log for ordering assertions

#![allow(dead_code)]

pub mod containers;
pub mod events;
pub mod mock_journal;
pub mod mock_source;

pub use containers::*;
pub use events::*;
pub use mock_journal::*;
pub use mock_source::*;
