//! Plaintext network layer for tests
//!
//! Implements [`MeshNetwork`] without any network-layer cryptography. A PDU
//! is `ttl || src (BE) || dst (BE) || net_idx (BE) || payload`, which keeps
//! proxy traffic human-readable in test assertions.

use super::{MeshError, MeshNetwork, NetIf, NetRx, NetTx, Subnet, SubnetTable};
use super::KeyRefreshPhase;

const HEADER_LEN: usize = 7;

/// Secure network beacon type octet.
pub const BEACON_TYPE_SECURE: u8 = 0x01;

pub struct SimNetwork {
    pub primary_addr: u16,
    pub provisioned: bool,
    pub gatt_proxy: bool,
    pub subnets: SubnetTable,
    /// PDUs received from proxy clients, in arrival order.
    pub received: Vec<(NetIf, NetRx)>,
    /// Beacons received from proxy clients.
    pub beacons: Vec<Vec<u8>>,
    pub fail_encode: bool,
}

impl SimNetwork {
    pub fn new(primary_addr: u16, subnet_capacity: usize) -> Self {
        Self {
            primary_addr,
            provisioned: true,
            gatt_proxy: true,
            subnets: SubnetTable::new(subnet_capacity),
            received: Vec::new(),
            beacons: Vec::new(),
            fail_encode: false,
        }
    }

    /// Encode a PDU in the simulator's plaintext format.
    pub fn encode_plain(tx: &NetTx, payload: &[u8]) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(HEADER_LEN + payload.len());
        pdu.push(tx.ttl);
        pdu.extend_from_slice(&tx.src.to_be_bytes());
        pdu.extend_from_slice(&tx.dst.to_be_bytes());
        pdu.extend_from_slice(&tx.net_idx.to_be_bytes());
        pdu.extend_from_slice(payload);
        pdu
    }

    /// Decode a PDU in the simulator's plaintext format.
    pub fn decode_plain(pdu: &[u8]) -> Result<NetRx, MeshError> {
        if pdu.len() < HEADER_LEN {
            return Err(MeshError::DecodeError(format!(
                "PDU too short ({} bytes)",
                pdu.len()
            )));
        }
        Ok(NetRx {
            src: u16::from_be_bytes([pdu[1], pdu[2]]),
            dst: u16::from_be_bytes([pdu[3], pdu[4]]),
            net_idx: u16::from_be_bytes([pdu[5], pdu[6]]),
            payload: pdu[HEADER_LEN..].to_vec(),
        })
    }
}

impl MeshNetwork for SimNetwork {
    fn primary_addr(&self) -> u16 {
        self.primary_addr
    }

    fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    fn gatt_proxy_enabled(&self) -> bool {
        self.gatt_proxy
    }

    fn subnets(&self) -> &SubnetTable {
        &self.subnets
    }

    fn subnets_mut(&mut self) -> &mut SubnetTable {
        &mut self.subnets
    }

    fn encode(&self, tx: &NetTx, payload: &[u8]) -> Result<Vec<u8>, MeshError> {
        if self.fail_encode {
            return Err(MeshError::EncodeError("simulated failure".to_string()));
        }
        if self.subnets.get(tx.net_idx).is_none() {
            return Err(MeshError::UnknownSubnet(tx.net_idx));
        }
        Ok(Self::encode_plain(tx, payload))
    }

    fn recv(&mut self, pdu: &[u8], net_if: NetIf) -> Result<NetRx, MeshError> {
        let rx = Self::decode_plain(pdu)?;
        if self.subnets.get(rx.net_idx).is_none() {
            return Err(MeshError::UnknownSubnet(rx.net_idx));
        }
        self.received.push((net_if, rx.clone()));
        Ok(rx)
    }

    fn create_beacon(&self, subnet: &Subnet) -> Vec<u8> {
        let flags = u8::from(subnet.kr_phase == KeyRefreshPhase::Phase2);
        let mut beacon = vec![BEACON_TYPE_SECURE, flags];
        beacon.extend_from_slice(&subnet.tx_keys().net_id);
        beacon
    }

    fn recv_beacon(&mut self, data: &[u8]) {
        self.beacons.push(data.to_vec());
    }
}
