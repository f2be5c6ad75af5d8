//! Deployment platform client for buildscope
//!
//! This crate provides the REST calls the log pipeline depends on: the
//! deployment events feed and the deployment status endpoint.

mod client;
mod error;
mod source;

pub use client::{ApiClient, ApiConfig, DEFAULT_API_URL, PollOptions};
pub use error::ApiError;
pub use source::{EventBody, EventSource};

// Re-export types that are used in our public API
pub use buildscope_types::{Deployment, LogsQuery, ReadyState};
