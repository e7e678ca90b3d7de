//! Proxy advertising payloads
//!
//! Network ID mode advertises the subnet's static Network ID. Node Identity
//! mode advertises `hash || random`, where the hash is the last 8 bytes of
//! `AES-128(IdentityKey, 0x000000000000 || random || address)`. The random
//! value is fresh for every advertising cycle so successive advertisements
//! cannot be linked to each other.

use aes_gcm::aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes_gcm::aes::Aes128;
use rand::RngCore;

use crate::ble::adv::{
    AdStructure, AD_FLAGS, AD_SVC_DATA16, AD_UUID16_ALL, FLAG_GENERAL_DISCOVERABLE, FLAG_NO_BREDR,
};
use crate::mesh::SubnetKeys;

/// 16-bit UUID of the Mesh Proxy service.
pub const MESH_PROXY_UUID: u16 = 0x1828;

pub const ID_TYPE_NET: u8 = 0x00;
pub const ID_TYPE_NODE: u8 = 0x01;

/// Service data length in Node Identity mode (UUID, type, hash, random).
pub const NODE_ID_LEN: usize = 19;
/// Service data length in Network ID mode (UUID, type, Network ID).
pub const NET_ID_LEN: usize = 11;

/// Decoded proxy service data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyServiceData {
    NetworkId([u8; 8]),
    NodeIdentity { hash: [u8; 8], random: [u8; 8] },
}

/// Node Identity hash for `addr` under `identity_key` and `random`.
pub fn node_identity_hash(identity_key: &[u8; 16], random: &[u8; 8], addr: u16) -> [u8; 8] {
    let mut block = [0u8; 16];
    block[6..14].copy_from_slice(random);
    block[14..16].copy_from_slice(&addr.to_be_bytes());

    let cipher = Aes128::new(GenericArray::from_slice(identity_key));
    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);

    let mut hash = [0u8; 8];
    hash.copy_from_slice(&block[8..16]);
    hash
}

/// Node Identity service data for the given random value.
pub fn node_identity_service_data(
    identity_key: &[u8; 16],
    random: &[u8; 8],
    addr: u16,
) -> [u8; NODE_ID_LEN] {
    let mut data = [0u8; NODE_ID_LEN];
    data[..2].copy_from_slice(&MESH_PROXY_UUID.to_le_bytes());
    data[2] = ID_TYPE_NODE;
    data[3..11].copy_from_slice(&node_identity_hash(identity_key, random, addr));
    data[11..19].copy_from_slice(random);
    data
}

pub fn network_id_service_data(net_id: &[u8; 8]) -> [u8; NET_ID_LEN] {
    let mut data = [0u8; NET_ID_LEN];
    data[..2].copy_from_slice(&MESH_PROXY_UUID.to_le_bytes());
    data[2] = ID_TYPE_NET;
    data[3..11].copy_from_slice(net_id);
    data
}

/// Wrap proxy service data in the advertising envelope: flags, the complete
/// 16-bit UUID list, then the service data itself.
pub fn advertising_data(service_data: &[u8]) -> Vec<AdStructure> {
    vec![
        AdStructure::new(AD_FLAGS, [FLAG_GENERAL_DISCOVERABLE | FLAG_NO_BREDR]),
        AdStructure::new(AD_UUID16_ALL, MESH_PROXY_UUID.to_le_bytes()),
        AdStructure::new(AD_SVC_DATA16, service_data),
    ]
}

/// Node Identity advertising data with a freshly drawn random value.
pub fn node_identity_ad<R: RngCore + ?Sized>(
    keys: &SubnetKeys,
    addr: u16,
    rng: &mut R,
) -> Vec<AdStructure> {
    let mut random = [0u8; 8];
    rng.fill_bytes(&mut random);

    log::debug!("node identity random {}", hex::encode(random));
    advertising_data(&node_identity_service_data(&keys.identity, &random, addr))
}

pub fn network_id_ad(keys: &SubnetKeys) -> Vec<AdStructure> {
    log::debug!("Advertising with NetId {}", hex::encode(keys.net_id));
    advertising_data(&network_id_service_data(&keys.net_id))
}

/// Parse proxy service data (including the UUID prefix).
pub fn parse_service_data(data: &[u8]) -> Option<ProxyServiceData> {
    if data.len() < 3 || data[..2] != MESH_PROXY_UUID.to_le_bytes() {
        return None;
    }

    match (data[2], data.len()) {
        (ID_TYPE_NET, NET_ID_LEN) => {
            let mut net_id = [0u8; 8];
            net_id.copy_from_slice(&data[3..11]);
            Some(ProxyServiceData::NetworkId(net_id))
        }
        (ID_TYPE_NODE, NODE_ID_LEN) => {
            let mut hash = [0u8; 8];
            let mut random = [0u8; 8];
            hash.copy_from_slice(&data[3..11]);
            random.copy_from_slice(&data[11..19]);
            Some(ProxyServiceData::NodeIdentity { hash, random })
        }
        _ => None,
    }
}

/// Whether Node Identity service data was produced by `addr` under
/// `identity_key`. This is the check a provisioner runs to find a node.
pub fn verify_node_identity(service_data: &[u8], identity_key: &[u8; 16], addr: u16) -> bool {
    match parse_service_data(service_data) {
        Some(ProxyServiceData::NodeIdentity { hash, random }) => {
            node_identity_hash(identity_key, &random, addr) == hash
        }
        _ => false,
    }
}
