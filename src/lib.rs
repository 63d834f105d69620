#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::doc_markdown,
    clippy::too_long_first_doc_paragraph
)]

//! gcs_client
//!
//! Async client for the PI General Command Set spoken by motion
//! controllers, covering both the line oriented GCS2 dialect and the block
//! structured GCS 3.0 dialect.
//!
//! Main pieces:
//! - argument encoding and typed answer decoding (`encoder`, `decoder`, `block`)
//! - the message layer with error checking and daisy chain addressing (`Connection`)
//! - dialect detection and the per-dialect command sets (`GcsDevice`)
//! - header-then-data array transfers and the data recorder (`bulk`, `recorder`)
//! - status word decoding and wait helpers (`status`, `waits`)
//! - a simulated controller for tests (separate crate `gcs_mock`)
//!
//! ```no_run
//! # async fn demo() -> gcs_client::Result<()> {
//! use gcs_client::GcsDevice;
//! let mut dev = GcsDevice::connect_tcp("192.168.0.10", 50000).await?;
//! println!("{} speaks {}", dev.qidn().await?, dev.dialect());
//! if dev.has("REC?").await? {
//!     let mut rec = dev.recorder(Some("REC_1")).await?;
//!     rec.set_traces(["AXIS_1 - 0x102".parse::<gcs_client::TraceAddress>()?])?;
//!     rec.set_number_of_values(1000)?;
//!     rec.arm().await?;
//!     let capture = rec.read(std::time::Duration::from_secs(5)).await?;
//!     println!("{} samples", capture.data[0].len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod bulk;
pub mod capabilities;
pub mod commands;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod device;
pub mod dialect;
pub mod encoder;
pub mod error;
pub mod error_codes;
pub mod gateway;
pub mod gcs_array;
pub mod params;
pub mod recorder;
pub mod status;
pub mod waits;

#[cfg(test)]
mod test_utils;

pub use bulk::{BulkBuffer, BulkHeader, TransferState};
pub use capabilities::Capabilities;
pub use commands::CommandSet;
pub use connection::{Connection, Session};
pub use device::GcsDevice;
pub use dialect::Dialect;
pub use error::{GcsError, Result};
pub use gateway::{Gateway, GatewayEvent, TcpGateway};
pub use params::{ParameterAddress, TraceAddress};
pub use recorder::{CaptureConfig, DataRecorder, RecorderState, Trigger};
pub use waits::WaitOptions;

/// Load the embedded GCS2 and GCS 3.0 error tables into the global
/// registries.
///
/// Translation loads them on first use anyway; calling this up front
/// surfaces a broken table early. Calling it more than once is harmless.
///
/// # Errors
///
/// Returns `Err(GcsError)` when an embedded table cannot be parsed.
pub fn init_defaults() -> Result<()> {
    error_codes::ensure_defaults()
}
