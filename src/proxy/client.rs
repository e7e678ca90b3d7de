//! Proxy client table
//!
//! One slot per simultaneous proxy connection. Slots are allocated on connect
//! and fully reset on release, so a reused slot always starts with an unset
//! filter, an empty reassembly buffer and a disarmed SAR timer.

use tokio::time::Instant;

use crate::ble::ConnHandle;

use super::filter::Filter;
use super::sar::Reassembler;
use super::ProxyError;

/// Per-connection proxy state.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    /// `None` while the slot is free.
    pub conn: Option<ConnHandle>,
    pub filter: Filter,
    pub rx: Reassembler,
}

impl ProxyClient {
    fn new(filter_size: usize, reassembly_capacity: usize) -> Self {
        Self {
            conn: None,
            filter: Filter::new(filter_size),
            rx: Reassembler::new(reassembly_capacity),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn reset(&mut self) {
        self.filter.reset();
        self.rx.reset();
    }
}

/// Fixed-capacity client table.
///
/// Lookups are linear scans; the table holds a handful of slots at most.
#[derive(Debug, Clone)]
pub struct ClientTable {
    slots: Vec<ProxyClient>,
}

impl ClientTable {
    pub fn new(capacity: usize, filter_size: usize, reassembly_capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| ProxyClient::new(filter_size, reassembly_capacity))
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots bound to a connection.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|c| c.is_connected()).count()
    }

    pub fn is_full(&self) -> bool {
        self.occupied() >= self.capacity()
    }

    pub fn find(&self, handle: ConnHandle) -> Option<&ProxyClient> {
        self.slots.iter().find(|c| c.conn == Some(handle))
    }

    pub fn find_mut(&mut self, handle: ConnHandle) -> Option<&mut ProxyClient> {
        self.slots.iter_mut().find(|c| c.conn == Some(handle))
    }

    /// Slot index bound to `handle`.
    pub fn find_slot(&self, handle: ConnHandle) -> Option<usize> {
        self.slots.iter().position(|c| c.conn == Some(handle))
    }

    pub fn slot(&self, index: usize) -> Option<&ProxyClient> {
        self.slots.get(index)
    }

    /// Bind `handle` to the first free slot and return its index.
    ///
    /// A handle that is already bound keeps its slot; it is reset as if it
    /// had just connected.
    pub fn allocate(&mut self, handle: ConnHandle) -> Result<usize, ProxyError> {
        let index = match self.find_slot(handle) {
            Some(index) => index,
            None => self
                .slots
                .iter()
                .position(|c| !c.is_connected())
                .ok_or(ProxyError::NoFreeClient)?,
        };

        let client = &mut self.slots[index];
        client.reset();
        client.conn = Some(handle);
        Ok(index)
    }

    /// Free the slot bound to `handle`, returning its index.
    pub fn release(&mut self, handle: ConnHandle) -> Result<usize, ProxyError> {
        let index = self
            .find_slot(handle)
            .ok_or(ProxyError::UnknownClient(handle))?;

        let client = &mut self.slots[index];
        client.reset();
        client.conn = None;
        Ok(index)
    }

    /// Connected clients with their handles.
    pub fn iter_connected(&self) -> impl Iterator<Item = (ConnHandle, &ProxyClient)> {
        self.slots
            .iter()
            .filter_map(|c| c.conn.map(|handle| (handle, c)))
    }

    pub fn iter_connected_mut(&mut self) -> impl Iterator<Item = (ConnHandle, &mut ProxyClient)> {
        self.slots.iter_mut().filter_map(|c| match c.conn {
            Some(handle) => Some((handle, c)),
            None => None,
        })
    }

    /// Handles of all connected clients, in slot order.
    pub fn handles(&self) -> Vec<ConnHandle> {
        self.iter_connected().map(|(handle, _)| handle).collect()
    }

    /// Earliest armed SAR deadline across connected clients.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.iter_connected()
            .filter_map(|(_, c)| c.rx.deadline())
            .min()
    }

    /// Connections whose SAR deadline is at or before `now`.
    pub fn expired(&self, now: Instant) -> Vec<ConnHandle> {
        self.iter_connected()
            .filter(|(_, c)| c.rx.deadline().is_some_and(|d| d <= now))
            .map(|(handle, _)| handle)
            .collect()
    }
}
