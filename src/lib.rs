//! tilemapd
//!
//! Library surface for the binary and for integration tests: protocol
//! dispatch, the source registry, the WMS compositor, and the ambient
//! config/logging/telemetry stack.

pub mod cache_control;
pub mod capabilities;
pub mod cli;
pub mod compositor;
pub mod config;
pub mod error;
pub mod image_ops;
pub mod logging;
pub mod mercator;
pub mod routes;
pub mod sources;
pub mod telemetry;

pub use config::Config;
pub use error::{Result, ServerError};
pub use routes::{build_router, AppState};
pub use sources::{SourceManager, TileFormat};
