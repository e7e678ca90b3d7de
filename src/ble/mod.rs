//! BLE transport layer for the mesh proxy bearer
//!
//! Provides the transport abstraction the proxy server drives, the
//! advertising-data envelope, and an in-process simulated transport for
//! testing.

pub mod adv;
pub mod simulated;
pub mod transport;

use thiserror::Error;

/// Handle of a live connection, as assigned by the host stack.
pub type ConnHandle = u16;

/// HCI reason code: remote user terminated connection.
pub const REASON_REMOTE_USER_TERM: u8 = 0x13;

/// Local role on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    /// We accepted the connection (we were advertising).
    Peripheral,
    /// We initiated the connection.
    Central,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Notification failed on connection {handle}: {reason}")]
    NotifyFailed { handle: ConnHandle, reason: String },

    #[error("Advertising error: {0}")]
    AdvertisingError(String),

    #[error("Failed to terminate connection {0}")]
    TerminateFailed(ConnHandle),

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },
}
