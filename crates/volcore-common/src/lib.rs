//! Volume Orchestration Core — shared types
//!
//! Shared data model, error taxonomy, configuration, and process-execution
//! helpers used by every crate in the volume orchestration core: the Cloud
//! Client Abstraction, Device Monitor, Repository, NBD Export Manager,
//! Volume Operations Service, Device Correlator, State Recovery, and the
//! File-Level Restore Mount Manager.

pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod process;

pub use error::{CoreError, CoreResult, ExternalCommandError};
pub use model::*;
