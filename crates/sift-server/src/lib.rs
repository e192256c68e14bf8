//! # Sift Server
//!
//! HTTP control plane for the Sift DNS filtering engine.
//!
//! The [`control`] module exposes the `/control/...` API used to toggle safe
//! browsing, parental control and safe search, edit blocked services and
//! rewrites, and run diagnostic host checks.

use std::net::SocketAddr;

use thiserror::Error;

pub mod control;

pub use control::ControlServer;

/// Server error types.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
