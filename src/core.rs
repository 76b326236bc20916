//! Core abstractions for the Q-SYS gateway.
//!
//! This module provides the foundational types shared by every layer:
//! control paths and values, the component index, change events and the
//! error model.

pub mod component;
pub mod control;
pub mod error;
pub mod events;

pub use component::*;
pub use control::*;
pub use error::{ErrorCode, QsysError, Result, Severity};
pub use events::*;
