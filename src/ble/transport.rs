//! BLE transport trait definitions
//!
//! Defines the host-stack primitives the proxy server needs. The server is
//! driven from a single serialized context, so the trait is synchronous and
//! takes `&mut self`; implementations hand the bytes to their radio stack and
//! return immediately.

use std::time::Duration;

use super::adv::{AdStructure, AdvParams};
use super::{BleError, ConnHandle};

/// Smallest ATT MTU every LE link supports.
pub const DEFAULT_ATT_MTU: usize = 23;

/// GATT peripheral primitives consumed by the proxy server.
pub trait ProxyTransport {
    /// Send one notification on the proxy data-out characteristic.
    fn notify(&mut self, handle: ConnHandle, data: &[u8]) -> Result<(), BleError>;

    /// Negotiated ATT MTU for the connection.
    fn mtu(&self, handle: ConnHandle) -> usize {
        let _ = handle;
        DEFAULT_ATT_MTU
    }

    /// Terminate a connection with the given HCI reason.
    fn terminate(&mut self, handle: ConnHandle, reason: u8) -> Result<(), BleError>;

    /// Start connectable advertising. `duration` of `None` means advertise
    /// until stopped or a connection is established.
    fn adv_start(
        &mut self,
        params: &AdvParams,
        duration: Option<Duration>,
        ad: &[AdStructure],
        scan_rsp: &[AdStructure],
    ) -> Result<(), BleError>;

    /// Stop advertising.
    fn adv_stop(&mut self) -> Result<(), BleError>;

    /// Show or hide the proxy service in the attribute database.
    fn set_service_visible(&mut self, visible: bool) -> Result<(), BleError>;

    /// Ask the advertising scheduler to re-evaluate what it should be
    /// advertising (e.g. a connection slot just opened up).
    fn request_adv_update(&mut self);
}

/// Maximum proxy PDU bytes a single notification can carry.
pub fn max_notify_len(att_mtu: usize) -> usize {
    att_mtu.saturating_sub(3)
}
