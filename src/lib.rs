//! sandbox-execd library
//!
//! This crate provides the core functionality for the sandbox execution
//! daemon:
//! - Sandbox runtime trait with a Docker-backed implementation
//! - Prewarm pool hiding container-start latency
//! - Session table tracking executions from submission to cleanup
//! - Executor and cleanup reaper driving the session lifecycle
//! - HTTP API exposing the submit/poll/cleanup/prewarm contract

pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod pool;
pub mod reaper;
pub mod runtime;
pub mod session;
