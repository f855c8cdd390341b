//! Live stream ingest and preprocessing
//!
//! Encoders connect over TCP, name a stream and push FLV media. Each publish
//! is checked with an external validator, then its frames are either cut into
//! keyframe-aligned segment files or relayed to a downstream frame processor.
//! Optionally every publisher is fanned out to any number of players.
//!
//! ```text
//! TcpListener ──► Session ──► ProtocolAdapter ──► SessionHandler callbacks
//!                    │                                   │
//!                    ▼                                   ▼
//!             SessionRegistry ◄──── authorize ──── FrameBroker ──► players
//!                    │
//!                    ▼
//!         LocalSegmentSink ──► StreamSegments ──► <basePath>/<url>/<n>_<time>.ts
//!         RelaySink        ──► gRPC MediaFrame/SendFrame
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use media_preprocessor::{AppConfig, IngestServer, SessionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> media_preprocessor::Result<()> {
//!     let config = AppConfig::load_from("config.yaml")?;
//!     let registry = Arc::new(SessionRegistry::from_config(&config)?);
//!     let server = IngestServer::new(config.listener(), Arc::clone(&registry));
//!     server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!     registry.terminate_all().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod segment;
pub mod server;
pub mod session;
pub mod sink;
pub mod stats;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use registry::SessionRegistry;
pub use server::{IngestServer, ServerConfig};
