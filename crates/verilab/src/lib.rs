//! Verilab orchestrator library - exposes modules for testing.

pub mod api;
pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod resolve;
pub mod run;
pub mod scheduler;
pub mod session;
pub mod verify;
