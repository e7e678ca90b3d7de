//! In-process BLE simulator
//!
//! A recording transport: every notification, advertisement and termination
//! the proxy server issues is captured so tests can inspect it. Clones share
//! the same state, so a test keeps one clone while the server owns another.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::adv::{AdStructure, AdvParams};
use super::transport::{max_notify_len, ProxyTransport, DEFAULT_ATT_MTU};
use super::{BleError, ConnHandle};

/// One captured `adv_start` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SimAdvertisement {
    pub params: AdvParams,
    pub duration: Option<Duration>,
    pub ad: Vec<AdStructure>,
    pub scan_rsp: Vec<AdStructure>,
}

#[derive(Debug, Default)]
struct SimState {
    notifications: Vec<(ConnHandle, Vec<u8>)>,
    advertisements: Vec<SimAdvertisement>,
    advertising: bool,
    terminated: Vec<(ConnHandle, u8)>,
    service_visible: bool,
    adv_update_requests: usize,
    mtu: HashMap<ConnHandle, usize>,
    failing_notify: HashSet<ConnHandle>,
    failing_adv: bool,
    failing_terminate: bool,
}

/// Recording implementation of [`ProxyTransport`].
#[derive(Clone, Default)]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not hide the recorded state from others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the ATT MTU reported for a connection.
    pub fn set_mtu(&self, handle: ConnHandle, mtu: usize) {
        self.state().mtu.insert(handle, mtu);
    }

    /// Make every notification to `handle` fail.
    pub fn fail_notify(&self, handle: ConnHandle) {
        self.state().failing_notify.insert(handle);
    }

    /// Make `adv_start` fail (or succeed again).
    pub fn fail_advertising(&self, fail: bool) {
        self.state().failing_adv = fail;
    }

    /// Make `terminate` fail (or succeed again).
    pub fn fail_terminate(&self, fail: bool) {
        self.state().failing_terminate = fail;
    }

    /// All notifications sent so far, in order.
    pub fn notifications(&self) -> Vec<(ConnHandle, Vec<u8>)> {
        self.state().notifications.clone()
    }

    /// Notifications sent to one connection, in order.
    pub fn notifications_for(&self, handle: ConnHandle) -> Vec<Vec<u8>> {
        self.state()
            .notifications
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Drain the notification log.
    pub fn take_notifications(&self) -> Vec<(ConnHandle, Vec<u8>)> {
        std::mem::take(&mut self.state().notifications)
    }

    pub fn advertisements(&self) -> Vec<SimAdvertisement> {
        self.state().advertisements.clone()
    }

    pub fn last_advertisement(&self) -> Option<SimAdvertisement> {
        self.state().advertisements.last().cloned()
    }

    pub fn is_advertising(&self) -> bool {
        self.state().advertising
    }

    pub fn terminated(&self) -> Vec<(ConnHandle, u8)> {
        self.state().terminated.clone()
    }

    pub fn service_visible(&self) -> bool {
        self.state().service_visible
    }

    pub fn adv_update_requests(&self) -> usize {
        self.state().adv_update_requests
    }
}

impl ProxyTransport for SimTransport {
    fn notify(&mut self, handle: ConnHandle, data: &[u8]) -> Result<(), BleError> {
        let mut state = self.state();
        if state.failing_notify.contains(&handle) {
            return Err(BleError::NotifyFailed {
                handle,
                reason: "simulated failure".to_string(),
            });
        }
        let max = max_notify_len(state.mtu.get(&handle).copied().unwrap_or(DEFAULT_ATT_MTU));
        if data.len() > max {
            return Err(BleError::MtuExceeded {
                size: data.len(),
                mtu: max,
            });
        }
        state.notifications.push((handle, data.to_vec()));
        Ok(())
    }

    fn mtu(&self, handle: ConnHandle) -> usize {
        self.state()
            .mtu
            .get(&handle)
            .copied()
            .unwrap_or(DEFAULT_ATT_MTU)
    }

    fn terminate(&mut self, handle: ConnHandle, reason: u8) -> Result<(), BleError> {
        let mut state = self.state();
        if state.failing_terminate {
            return Err(BleError::TerminateFailed(handle));
        }
        state.terminated.push((handle, reason));
        Ok(())
    }

    fn adv_start(
        &mut self,
        params: &AdvParams,
        duration: Option<Duration>,
        ad: &[AdStructure],
        scan_rsp: &[AdStructure],
    ) -> Result<(), BleError> {
        let mut state = self.state();
        if state.failing_adv {
            return Err(BleError::AdvertisingError(
                "simulated failure".to_string(),
            ));
        }
        state.advertisements.push(SimAdvertisement {
            params: *params,
            duration,
            ad: ad.to_vec(),
            scan_rsp: scan_rsp.to_vec(),
        });
        state.advertising = true;
        Ok(())
    }

    fn adv_stop(&mut self) -> Result<(), BleError> {
        self.state().advertising = false;
        Ok(())
    }

    fn set_service_visible(&mut self, visible: bool) -> Result<(), BleError> {
        self.state().service_visible = visible;
        Ok(())
    }

    fn request_adv_update(&mut self) {
        self.state().adv_update_requests += 1;
    }
}
