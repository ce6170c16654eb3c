//! # rtxlink
//!
//! Async session and command execution engine for Yamaha RTX router
//! automation.
//!
//! RTX routers speak an interactive, line-oriented shell over SSH with
//! no structured RPC surface. rtxlink turns that shell into a typed
//! API: commands go in, cleaned responses come out, and the awkward
//! parts (prompt detection, pagination, administrator elevation, the
//! hardware's session ceiling) are handled underneath.
//!
//! ## Features
//!
//! - Async SSH via russh, bulk config reads via SFTP
//! - Bounded session pool honoring the hardware's login ceiling
//! - Prompt detection and privilege elevation as injectable strategies
//! - Typed failure taxonomy driving retry decisions
//! - Per-object locking and a TTL'd configuration snapshot cache
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtxlink::{Command, RtxClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rtxlink::Error> {
//!     let client = RtxClient::builder("192.168.100.1")
//!         .username("admin")
//!         .password("secret")
//!         .admin_password("secret")
//!         .build()?;
//!
//!     let result = client.run(&Command::new("status", "show status")).await?;
//!     println!("{}", result.body);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod error;
pub mod executor;
pub mod lock;
pub mod session;
pub mod snapshot;
pub mod transport;

// Re-export main types for convenience
pub use channel::{PromptDetector, PromptSignal, RtxPromptDetector};
pub use client::{ClientBuilder, RtxClient};
pub use error::{Error, FailureKind, Result};
pub use executor::{
    Command, CommandResult, ExponentialBackoff, FixedDelay, NoRetry, RetryPolicy,
};
pub use lock::KeyedMutex;
pub use session::{Lease, PoolStats, SessionPool};
pub use snapshot::{ConfigContext, ConfigSnapshot, ParsedConfig, SnapshotCache};
pub use transport::{AuthMethod, HostKeyVerification, PoolConfig, TargetConfig};
