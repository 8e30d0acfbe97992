//! Execution engine for stackform
//!
//! The engine orchestrates:
//! 1. Loading - Parse the stack file and resolve settings
//! 2. Planning - Validate the graph and diff it against recorded state
//! 3. Executing - Confirm, then drive the change-set through a backend

pub mod differ;
pub mod executor;
pub mod planner;

pub use executor::{RunOptions, RunResult};
pub use planner::{LoadedStack, load};
