//! PVH Client - Client library for the pvhotwater daemon
//!
//! Speaks the local control protocol over the daemon's Unix socket. Used by
//! the `pvh-health` check and by external API processes.
//!
//! ```rust,ignore
//! use pvh_client::{ClientConfig, ControlClient};
//!
//! let mut client = ControlClient::connect(&ClientConfig::default()).await?;
//! let report = client.get_health(None).await?;
//! println!("{}", report.summary);
//! ```

pub mod client;
pub mod error;

pub use client::{ClientConfig, ControlClient, DEFAULT_SOCKET_PATH};
pub use error::{ClientError, Result};
