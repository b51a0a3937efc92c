//! # Streaming Relay
//!
//! Everything that happens inside one browser ↔ provider relay session.
//!
//! ## Key Components:
//! - **protocol**: provider wire format, one adapter per protocol variant
//! - **frames**: browser wire format (inbound frames, outbound transcripts)
//! - **transcoder**: external decoder process for container audio
//! - **upstream**: provider connection (trait + WebSocket implementation)
//! - **session**: the per-connection coordinator and its state machine
//! - **lifecycle**: ordered, idempotent teardown
//!
//! ## Data Flow:
//! ```text
//! client frame → frames → [transcoder] → protocol → upstream
//! upstream → protocol → frames → client
//! ```

pub mod frames;
pub mod lifecycle;
pub mod protocol;
pub mod session;
pub mod transcoder;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use lifecycle::TeardownReason;
pub use session::{ClientCommand, ClientEvent, ClientLink, Session, SessionSettings};
