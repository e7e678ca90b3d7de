//! Proxy server state machine
//!
//! [`ProxyServer`] owns the client table, the advertising rotation and the
//! deferred task queue. Every operation takes `&mut self`; callers serialize
//! events onto it (see [`super::service`]), so no locking happens here.

use std::collections::VecDeque;

use bytes::BytesMut;
use rand::RngCore;
use tokio::time::Instant;

use crate::ble::adv::{AdStructure, AdvParams, AD_NAME_COMPLETE};
use crate::ble::transport::{max_notify_len, ProxyTransport};
use crate::ble::{ConnHandle, ConnRole, REASON_REMOTE_USER_TERM};
use crate::mesh::{
    MeshError, MeshNetwork, NetIf, NetTx, NodeIdentity, SubnetEvent, ADDR_UNASSIGNED,
};

use super::client::ClientTable;
use super::config::ProxyConfig;
use super::filter::{FilterMode, FilterStatus};
use super::identity;
use super::rotation::{AdvMode, AdvPlan, AdvRotator};
use super::sar::{segment, MsgType};
use super::ProxyError;

/// Work deferred until the current event has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Send the beacon of every subnet to one client.
    SendBeacons { handle: ConnHandle },
}

pub struct ProxyServer<T, N, R> {
    config: ProxyConfig,
    transport: T,
    net: N,
    rng: R,
    clients: ClientTable,
    rotator: AdvRotator,
    service_registered: bool,
    tasks: VecDeque<Task>,
}

impl<T, N, R> ProxyServer<T, N, R>
where
    T: ProxyTransport,
    N: MeshNetwork,
    R: RngCore,
{
    pub fn new(config: ProxyConfig, transport: T, net: N, rng: R) -> Result<Self, ProxyError> {
        config.validate()?;
        let clients = ClientTable::new(
            config.max_connections,
            config.filter_size,
            config.reassembly_capacity,
        );

        Ok(Self {
            config,
            transport,
            net,
            rng,
            clients,
            rotator: AdvRotator::new(),
            service_registered: false,
            tasks: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn net(&self) -> &N {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut N {
        &mut self.net
    }

    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    pub fn rotator(&self) -> &AdvRotator {
        &self.rotator
    }

    /// Whether the proxy service is exposed to GATT clients.
    pub fn is_enabled(&self) -> bool {
        self.service_registered
    }

    pub fn pending_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// A link came up. Only connections we accepted while the service is
    /// enabled become proxy clients; others are ignored.
    pub fn on_connect(&mut self, handle: ConnHandle, role: ConnRole) -> Result<(), ProxyError> {
        if role != ConnRole::Peripheral || !self.service_registered {
            return Ok(());
        }
        log::debug!("conn {}", handle);

        if let Err(e) = self.clients.allocate(handle) {
            log::error!("No free Proxy Client objects");
            return Err(e);
        }

        // Keep advertising while there is room for another client.
        if self.clients.occupied() < self.clients.capacity() {
            self.transport.request_adv_update();
        }
        Ok(())
    }

    pub fn on_disconnect(&mut self, handle: ConnHandle, reason: u8) -> Result<(), ProxyError> {
        log::debug!("conn handle {} reason 0x{:02x}", handle, reason);

        if let Err(e) = self.clients.release(handle) {
            log::warn!("No Gatt Client found for conn {}", handle);
            return Err(e);
        }
        self.tasks
            .retain(|task| !matches!(task, Task::SendBeacons { handle: h } if *h == handle));

        self.transport.request_adv_update();
        Ok(())
    }

    /// The client enabled notifications on the data-out characteristic.
    ///
    /// An unconfigured filter becomes an empty allow list and a beacon burst
    /// is queued for the client.
    pub fn on_subscribe(&mut self, handle: ConnHandle) -> Result<(), ProxyError> {
        log::debug!("conn_handle {}", handle);

        let client = self
            .clients
            .find_mut(handle)
            .ok_or(ProxyError::UnknownClient(handle))?;

        if client.filter.mode() == FilterMode::Unset {
            client.filter.set_mode(FilterMode::Allow);
            self.tasks.push_back(Task::SendBeacons { handle });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound traffic
    // ------------------------------------------------------------------

    /// A client wrote one proxy PDU to the data-in characteristic.
    pub fn on_data_in(&mut self, handle: ConnHandle, pdu: &[u8]) -> Result<(), ProxyError> {
        let timeout = self.config.sar_timeout();
        let client = self
            .clients
            .find_mut(handle)
            .ok_or(ProxyError::UnknownClient(handle))?;

        let (msg_type, msg) = match client.rx.recv(pdu, Instant::now(), timeout) {
            Ok(Some(complete)) => complete,
            Ok(None) => return Ok(()),
            Err(e) => {
                log::warn!("conn {}: {}", handle, e);
                return Err(e.into());
            }
        };

        log::debug!(
            "conn {} type 0x{:02x} {} bytes: {}",
            handle,
            msg_type,
            msg.len(),
            hex::encode(&msg)
        );

        match MsgType::from_bits(msg_type) {
            Some(MsgType::NetPdu) => {
                let rx = self.net.recv(&msg, NetIf::Proxy).map_err(|e| {
                    log::warn!("Dropping network PDU from conn {}: {}", handle, e);
                    e
                })?;
                self.addr_add(handle, rx.src);
            }
            Some(MsgType::Beacon) => self.net.recv_beacon(&msg),
            Some(MsgType::Config) => self.recv_config(handle, &msg)?,
            Some(MsgType::Prov) => {
                log::debug!("Provisioning PDU on proxy connection {} dropped", handle);
            }
            None => {
                log::warn!("Unhandled message type 0x{:02x}", msg_type);
            }
        }
        Ok(())
    }

    fn recv_config(&mut self, handle: ConnHandle, msg: &[u8]) -> Result<(), ProxyError> {
        let rx = self.net.recv(msg, NetIf::ProxyCfg).map_err(|e| {
            log::warn!("Failed to decode proxy configuration (err {})", e);
            e
        })?;

        // Configuration messages always have dst unassigned
        if rx.dst != ADDR_UNASSIGNED {
            log::warn!("Proxy Configuration to non-unassigned dst 0x{:04x}", rx.dst);
            return Err(ProxyError::UnexpectedDestination(rx.dst));
        }

        let client = self
            .clients
            .find_mut(handle)
            .ok_or(ProxyError::UnknownClient(handle))?;

        match client.filter.handle_config(&rx.payload) {
            Some(status) => self.send_filter_status(handle, rx.net_idx, status),
            None => Ok(()),
        }
    }

    fn send_filter_status(
        &mut self,
        handle: ConnHandle,
        net_idx: u16,
        status: FilterStatus,
    ) -> Result<(), ProxyError> {
        let tx = NetTx {
            net_idx,
            src: self.net.primary_addr(),
            dst: ADDR_UNASSIGNED,
            ttl: 0,
        };
        let payload = status.to_bytes();
        log::debug!("{} bytes: {}", payload.len(), hex::encode(payload));

        let pdu = self.net.encode(&tx, &payload).map_err(|e| {
            log::error!("Encoding Proxy cfg message failed (err {})", e);
            e
        })?;

        self.send(handle, MsgType::Config, BytesMut::from(&pdu[..]))
            .map_err(|e| {
                log::error!("Failed to send proxy cfg message (err {})", e);
                e
            })
    }

    /// Apply a source address seen in a network PDU from `handle`.
    pub fn addr_add(&mut self, handle: ConnHandle, addr: u16) {
        if let Some(client) = self.clients.find_mut(handle) {
            client.filter.learn_source(addr);
        }
    }

    // ------------------------------------------------------------------
    // Outbound traffic
    // ------------------------------------------------------------------

    /// Segment `buf` to the connection's MTU and notify each segment.
    pub fn send(
        &mut self,
        handle: ConnHandle,
        msg_type: MsgType,
        buf: BytesMut,
    ) -> Result<(), ProxyError> {
        let max_len = max_notify_len(self.transport.mtu(handle));
        for seg in segment(msg_type, buf, max_len)? {
            log::debug!("conn {} {} bytes: {}", handle, seg.len(), hex::encode(&seg));
            self.transport.notify(handle, &seg)?;
        }
        Ok(())
    }

    /// Forward a network PDU to every client whose filter accepts `dst`.
    ///
    /// Returns whether any client had a send started. `pdu` is never
    /// modified; each client is sent its own copy.
    pub fn relay(&mut self, pdu: &[u8], dst: u16) -> bool {
        log::debug!("{} bytes to dst 0x{:04x}", pdu.len(), dst);

        let targets: Vec<ConnHandle> = self
            .clients
            .iter_connected()
            .filter(|(_, client)| client.filter.matches(dst))
            .map(|(handle, _)| handle)
            .collect();

        let mut relayed = false;
        for handle in targets {
            let copy = BytesMut::from(pdu);
            if let Err(e) = self.send(handle, MsgType::NetPdu, copy) {
                log::error!("Failed to send proxy message to conn {} (err {})", handle, e);
                continue;
            }
            relayed = true;
        }
        relayed
    }

    /// Send one subnet's beacon to every connected client.
    pub fn beacon_send(&mut self, net_idx: u16) -> Result<(), ProxyError> {
        let beacon = self.beacon_for(net_idx)?;
        for handle in self.clients.handles() {
            if let Err(e) = self.send(handle, MsgType::Beacon, BytesMut::from(&beacon[..])) {
                log::warn!("Failed to send beacon to conn {} (err {})", handle, e);
            }
        }
        Ok(())
    }

    /// Send every subnet's beacon to every connected client.
    pub fn beacon_send_all(&mut self) {
        for net_idx in self.subnet_indices() {
            if let Err(e) = self.beacon_send(net_idx) {
                log::warn!("{}", e);
            }
        }
    }

    fn send_beacons(&mut self, handle: ConnHandle) {
        for net_idx in self.subnet_indices() {
            let result = self
                .beacon_for(net_idx)
                .and_then(|beacon| self.send(handle, MsgType::Beacon, BytesMut::from(&beacon[..])));
            if let Err(e) = result {
                log::warn!("Failed to send beacon to conn {} (err {})", handle, e);
            }
        }
    }

    fn beacon_for(&self, net_idx: u16) -> Result<Vec<u8>, ProxyError> {
        let sub = self
            .net
            .subnets()
            .get(net_idx)
            .ok_or(MeshError::UnknownSubnet(net_idx))?;
        Ok(self.net.create_beacon(sub))
    }

    fn subnet_indices(&self) -> Vec<u16> {
        self.net.subnets().iter().map(|sub| sub.net_idx).collect()
    }

    /// Run queued tasks. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.tasks.pop_front() {
            match task {
                Task::SendBeacons { handle } => self.send_beacons(handle),
            }
            ran += 1;
        }
        ran
    }

    // ------------------------------------------------------------------
    // SAR timeouts
    // ------------------------------------------------------------------

    /// Earliest SAR deadline across clients.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.clients.next_deadline()
    }

    /// Terminate every connection whose partial message has timed out.
    ///
    /// The slot itself is freed when the disconnect comes back.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<ConnHandle> {
        let expired = self.clients.expired(now);
        for &handle in &expired {
            log::warn!("Proxy SAR timeout on conn {}", handle);
            if let Some(client) = self.clients.find_mut(handle) {
                client.rx.reset();
            }
            if let Err(e) = self.transport.terminate(handle, REASON_REMOTE_USER_TERM) {
                log::error!("Failed to terminate conn {} (err {})", handle, e);
            }
        }
        expired
    }

    // ------------------------------------------------------------------
    // Node Identity
    // ------------------------------------------------------------------

    /// Start Node Identity on a subnet and advertise it next.
    pub fn identity_start(&mut self, net_idx: u16) -> Result<(), ProxyError> {
        let sub = self
            .net
            .subnets_mut()
            .get_mut(net_idx)
            .ok_or(MeshError::UnknownSubnet(net_idx))?;
        sub.node_id = NodeIdentity::Running(Instant::now());
        self.rotator.prioritize(net_idx);
        Ok(())
    }

    pub fn identity_stop(&mut self, net_idx: u16) -> Result<(), ProxyError> {
        let sub = self
            .net
            .subnets_mut()
            .get_mut(net_idx)
            .ok_or(MeshError::UnknownSubnet(net_idx))?;
        sub.node_id = NodeIdentity::Stopped;
        Ok(())
    }

    /// Start Node Identity on every subnet.
    pub fn identity_enable(&mut self) -> Result<(), ProxyError> {
        if !self.net.is_provisioned() {
            return Err(ProxyError::NotProvisioned);
        }

        let now = Instant::now();
        let mut started = 0;
        for sub in self.net.subnets_mut().iter_mut() {
            sub.node_id = NodeIdentity::Running(now);
            started += 1;
        }

        if started > 0 {
            self.transport.request_adv_update();
        }
        Ok(())
    }

    /// Stop Node Identity on every subnet.
    pub fn identity_disable(&mut self) {
        for sub in self.net.subnets_mut().iter_mut() {
            sub.node_id = NodeIdentity::Stopped;
        }
    }

    // ------------------------------------------------------------------
    // Service visibility
    // ------------------------------------------------------------------

    pub fn gatt_enable(&mut self) -> Result<(), ProxyError> {
        if !self.net.is_provisioned() {
            return Err(ProxyError::NotSupported);
        }
        if self.service_registered {
            return Err(ProxyError::Busy);
        }

        self.transport.set_service_visible(true)?;
        self.service_registered = true;

        for (_, client) in self.clients.iter_connected_mut() {
            client.filter.set_mode(FilterMode::Allow);
        }
        Ok(())
    }

    /// Drop every client that configured a filter.
    pub fn gatt_disconnect(&mut self) {
        let mut doomed = Vec::new();
        for (handle, client) in self.clients.iter_connected_mut() {
            if matches!(client.filter.mode(), FilterMode::Allow | FilterMode::Deny) {
                client.filter.set_mode(FilterMode::Unset);
                doomed.push(handle);
            }
        }

        for handle in doomed {
            if let Err(e) = self.transport.terminate(handle, REASON_REMOTE_USER_TERM) {
                log::error!("Failed to terminate conn {} (err {})", handle, e);
            }
        }
    }

    pub fn gatt_disable(&mut self) -> Result<(), ProxyError> {
        if !self.service_registered {
            return Err(ProxyError::AlreadyDisabled);
        }

        self.gatt_disconnect();
        if let Err(e) = self.transport.adv_stop() {
            log::warn!("Failed to stop proxy advertising (err {})", e);
        }
        self.transport.set_service_visible(false)?;
        self.service_registered = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------

    /// Run one advertising cycle.
    pub fn adv_start(&mut self) -> Result<AdvPlan, ProxyError> {
        if !self.service_registered || !self.net.is_provisioned() {
            return Err(ProxyError::NotSupported);
        }

        if self.clients.is_full() {
            log::debug!(
                "Connectable advertising deferred (max connections {})",
                self.clients.capacity()
            );
            return Err(ProxyError::ConnectionLimit(self.clients.capacity()));
        }

        let gatt_proxy = self.net.gatt_proxy_enabled();
        let timeout = self.config.node_id_timeout();
        let plan = self
            .rotator
            .plan(self.net.subnets_mut(), gatt_proxy, timeout, Instant::now())
            .map_err(|e| {
                log::warn!("No subnets to advertise on");
                e
            })?;

        let keys = self
            .net
            .subnets()
            .get(plan.net_idx)
            .map(|sub| sub.tx_keys().clone())
            .ok_or(ProxyError::NoSubnets)?;

        let (params, ad) = match plan.mode {
            AdvMode::NodeIdentity => (
                AdvParams::fast(),
                identity::node_identity_ad(&keys, self.net.primary_addr(), &mut self.rng),
            ),
            AdvMode::NetworkId => (AdvParams::slow(), identity::network_id_ad(&keys)),
        };

        let scan_rsp: Vec<AdStructure> = self
            .config
            .device_name
            .iter()
            .map(|name| AdStructure::new(AD_NAME_COMPLETE, name.as_bytes()))
            .collect();

        if let Err(e) = self.transport.adv_start(&params, plan.duration, &ad, &scan_rsp) {
            log::warn!("Failed to advertise using {:?} (err {})", plan.mode, e);
            return Err(e.into());
        }
        Ok(plan)
    }

    /// React to a subnet change reported by the network layer.
    pub fn subnet_event(&mut self, net_idx: u16, event: SubnetEvent) {
        log::debug!("net_idx 0x{:04x} {:?}", net_idx, event);

        match event {
            SubnetEvent::Deleted => self.rotator.on_subnet_deleted(net_idx),
            _ => {
                if let Err(e) = self.beacon_send(net_idx) {
                    log::warn!("{}", e);
                }
            }
        }
    }
}
