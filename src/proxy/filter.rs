//! Proxy filters
//!
//! Each proxy client owns a filter deciding which destination addresses are
//! relayed to it. An allow list passes only listed addresses (plus the
//! all-nodes address); a deny list passes everything not listed. Clients
//! configure their filter with proxy configuration messages.

use crate::mesh::{ADDR_ALL_NODES, ADDR_UNASSIGNED};

use super::ProxyError;

/// Configuration opcode: Set Filter Type.
pub const OP_FILTER_SET: u8 = 0x00;
/// Configuration opcode: Add Addresses To Filter.
pub const OP_FILTER_ADD: u8 = 0x01;
/// Configuration opcode: Remove Addresses From Filter.
pub const OP_FILTER_REMOVE: u8 = 0x02;
/// Configuration opcode: Filter Status.
pub const OP_FILTER_STATUS: u8 = 0x03;

/// Filter type octet for an allow list.
pub const FILTER_TYPE_ALLOW: u8 = 0x00;
/// Filter type octet for a deny list.
pub const FILTER_TYPE_DENY: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Not configured yet; behaves as an empty allow list.
    #[default]
    Unset,
    Allow,
    Deny,
    /// Connection used for provisioning; only all-nodes traffic passes.
    ProvisioningOnly,
}

impl FilterMode {
    /// Parse a Set Filter Type octet. Only allow and deny lists can be
    /// requested by a client.
    pub fn from_type(filter_type: u8) -> Result<Self, ProxyError> {
        match filter_type {
            FILTER_TYPE_ALLOW => Ok(FilterMode::Allow),
            FILTER_TYPE_DENY => Ok(FilterMode::Deny),
            other => Err(ProxyError::InvalidFilterType(other)),
        }
    }

    /// Filter type octet reported in Filter Status.
    pub fn status_type(&self) -> u8 {
        match self {
            FilterMode::Allow => FILTER_TYPE_ALLOW,
            _ => FILTER_TYPE_DENY,
        }
    }
}

/// Payload of a Filter Status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterStatus {
    pub filter_type: u8,
    pub list_size: u16,
}

impl FilterStatus {
    /// `opcode || filter_type || list_size (BE)`
    pub fn to_bytes(&self) -> [u8; 4] {
        let size = self.list_size.to_be_bytes();
        [OP_FILTER_STATUS, self.filter_type, size[0], size[1]]
    }
}

/// Address filter with a capacity fixed at construction.
#[derive(Debug, Clone)]
pub struct Filter {
    mode: FilterMode,
    addrs: Vec<u16>,
    capacity: usize,
}

impl Filter {
    pub fn new(capacity: usize) -> Self {
        Self {
            mode: FilterMode::Unset,
            addrs: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Change the mode without touching the address list.
    pub fn set_mode(&mut self, mode: FilterMode) {
        self.mode = mode;
    }

    /// Handle Set Filter Type: clears the list and switches mode. Any type
    /// other than allow/deny leaves the filter untouched.
    pub fn set_type(&mut self, filter_type: u8) -> Result<(), ProxyError> {
        let mode = FilterMode::from_type(filter_type)?;
        self.addrs.clear();
        self.mode = mode;
        Ok(())
    }

    /// Back to the unconfigured state.
    pub fn reset(&mut self) {
        self.addrs.clear();
        self.mode = FilterMode::Unset;
    }

    /// Add an address. The unassigned address and duplicates are ignored;
    /// when the list is full the address is dropped.
    pub fn add(&mut self, addr: u16) {
        log::debug!("filter add 0x{:04x}", addr);

        if addr == ADDR_UNASSIGNED || self.contains(addr) {
            return;
        }
        if self.addrs.len() >= self.capacity {
            log::debug!("filter full, dropping 0x{:04x}", addr);
            return;
        }
        self.addrs.push(addr);
    }

    pub fn remove(&mut self, addr: u16) {
        log::debug!("filter remove 0x{:04x}", addr);

        if let Some(pos) = self.addrs.iter().position(|a| *a == addr) {
            self.addrs.swap_remove(pos);
        }
    }

    pub fn contains(&self, addr: u16) -> bool {
        self.addrs.contains(&addr)
    }

    /// Number of addresses in the list.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn addrs(&self) -> &[u16] {
        &self.addrs
    }

    /// Whether traffic to `dst` should be relayed to this client.
    pub fn matches(&self, dst: u16) -> bool {
        if self.mode == FilterMode::Deny {
            return !self.contains(dst);
        }

        if dst == ADDR_ALL_NODES {
            return true;
        }

        match self.mode {
            FilterMode::Allow | FilterMode::Unset => self.contains(dst),
            _ => false,
        }
    }

    pub fn status(&self) -> FilterStatus {
        FilterStatus {
            filter_type: self.mode.status_type(),
            list_size: self.addrs.len() as u16,
        }
    }

    /// Apply a source address seen in traffic from this client: an allow
    /// list learns it, a deny list forgets it.
    pub fn learn_source(&mut self, addr: u16) {
        log::debug!("filter mode {:?} addr 0x{:04x}", self.mode, addr);

        match self.mode {
            FilterMode::Allow => self.add(addr),
            FilterMode::Deny => self.remove(addr),
            _ => {}
        }
    }

    /// Process a decrypted proxy configuration message.
    ///
    /// Returns the status to report back, or `None` for opcodes that get no
    /// response. A malformed Set still yields a status describing the
    /// unchanged filter; a trailing odd byte in Add/Remove is ignored.
    pub fn handle_config(&mut self, msg: &[u8]) -> Option<FilterStatus> {
        let (&opcode, params) = match msg.split_first() {
            Some(split) => split,
            None => {
                log::warn!("Empty proxy configuration message");
                return None;
            }
        };

        match opcode {
            OP_FILTER_SET => {
                let result = params
                    .first()
                    .ok_or(ProxyError::TooShort("Filter Set"))
                    .and_then(|&filter_type| self.set_type(filter_type));
                if let Err(e) = result {
                    log::warn!("{}", e);
                }
            }
            OP_FILTER_ADD => {
                for addr in addresses(params) {
                    self.add(addr);
                }
            }
            OP_FILTER_REMOVE => {
                for addr in addresses(params) {
                    self.remove(addr);
                }
            }
            other => {
                log::warn!("Unhandled configuration OpCode 0x{:02x}", other);
                return None;
            }
        }

        Some(self.status())
    }
}

/// Big-endian address list; a trailing odd byte is dropped.
fn addresses(params: &[u8]) -> impl Iterator<Item = u16> + '_ {
    params
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
}
