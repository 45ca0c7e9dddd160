//! Centralized error handling for deployd
//!
//! Subsystem boundaries carry their own typed errors (`StoreError` in the
//! store, `RuntimeError` in the runtime adapters, `ProbeError` in the health
//! probes); this module defines the orchestration-level errors the web
//! surface maps onto HTTP responses, plus the top-level `AppError` used
//! during startup and wiring.
//!
//! # Usage
//!
//! ```rust
//! use deployd::errors::{AppError, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     Ok(())
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;
