//! Debug-aware launching of ROS launch files.
//!
//! A launch file is evaluated into per-node command lines, each node is
//! either started plainly or handed to the IDE host as a debug session, and
//! the resulting group is supervised until the debug sessions end.

pub mod command;
pub mod config;
pub mod core_service;
pub mod debug_config;
pub mod error;
pub mod evaluator;
pub mod group;
pub mod host;
pub mod launch;
pub mod output;
pub mod plan;
pub mod terminate;
pub mod whitelist;

pub use error::{LaunchError, Result};
