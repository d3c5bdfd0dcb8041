//! Media Relay — admission-controlled download jobs with live progress fan-out.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod jobs;
