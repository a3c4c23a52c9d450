//! UDS and KWP2000 diagnostics through consumer ELM327 adapters
//!
//! This crate talks ISO 14229 (UDS) and ISO 14230 (KWP2000) to vehicle
//! control units on an ISO 15765-4 CAN bus, using nothing more capable than
//! a consumer-grade ELM327 serial or Bluetooth adapter.
//!
//! The awkward part, and the reason this crate exists: widespread clone
//! adapters silently drop any frame sent with a physical CAN source header.
//! The [adapter::AdapterController] therefore rewrites every addressed
//! request into an equivalent broadcast-plus-receive-filter configuration
//! behind the caller's back, preserving the illusion of per-ECU addressing
//! for every layer above it.
//!
//! Layering, leaves first:
//! * [transport] - prompt-framed byte channel to the adapter
//! * [adapter] - configuration state, the exchange gate, the rewrite
//! * [isotp] - line-oriented ISO-TP reassembly
//! * [uds] / [kwp2000] - service encoding and response classification
//! * [engine] - discovery, selection, sessions, typed readings
//! * [catalog] - the static ECU/DID/DTC tables everything shares

pub mod adapter;
pub mod catalog;
pub mod dtc;
pub mod engine;
pub mod hardware;
pub mod isotp;
pub mod kwp2000;
pub mod transport;
pub mod uds;

pub use adapter::{AdapterError, Phase};
pub use dtc::Dtc;
pub use engine::{DiagnosticEngine, DpfData, EngineData};
pub use hardware::DeviceRef;
pub use transport::TransportError;

/// Diagnostic operation result
pub type DiagResult<T> = Result<T, DiagError>;

/// Error produced by the protocol layers and the engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiagError {
    /// Failure below the protocol layer
    #[error("adapter error")]
    Adapter(
        #[from]
        #[source]
        AdapterError,
    ),
    /// The ECU did not answer within the adapter's window
    #[error("ECU sent no data")]
    NoData,
    /// Well-formed `7F` reply from the ECU, surfaced untouched
    #[error("negative response to service 0x{service:02X}, NRC 0x{nrc:02X}")]
    NegativeResponse {
        /// Service the ECU rejected
        service: u8,
        /// Negative response code
        nrc: u8,
    },
    /// The reply does not echo the expected service or identifier
    #[error("reply does not match the request")]
    ProtocolMismatch,
    /// The reply is too short for its service
    #[error("response length invalid")]
    InvalidResponseLength,
    /// No ECU with that code in the address catalog
    #[error("unknown ECU code")]
    UnknownEcu,
    /// No DID with that id in the measurement catalog
    #[error("unknown data identifier 0x{0:04X}")]
    UnknownDid(u16),
}

impl From<TransportError> for DiagError {
    fn from(e: TransportError) -> Self {
        DiagError::Adapter(e.into())
    }
}
