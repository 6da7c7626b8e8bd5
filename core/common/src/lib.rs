//! Common utilities and types shared across Capsule modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod error;
pub mod task;
pub mod types;

pub use error::{Error, Result};
pub use task::TaskContext;
pub use types::{DirSegments, IdKind, SensitiveBytes};
