//! Cutoverctl library - exposes modules for testing

pub mod cli;
pub mod commands;
pub mod executor;
pub mod logging;
