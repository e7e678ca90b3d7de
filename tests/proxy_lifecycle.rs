//! Proxy server lifecycle against the in-process simulators
//!
//! Drives connect/subscribe/configure/relay/advertise/disconnect through the
//! public API, with SimTransport recording everything the server puts on
//! air and SimNetwork standing in for the mesh network layer.
//!
//! Run with:
//!   cargo test --test proxy_lifecycle

use std::time::Duration;

use mesh_proxy::ble::adv::{self, AdvParams, AD_SVC_DATA16};
use mesh_proxy::ble::simulated::SimTransport;
use mesh_proxy::ble::{ConnRole, REASON_REMOTE_USER_TERM};
use mesh_proxy::mesh::simulated::SimNetwork;
use mesh_proxy::mesh::{
    MeshNetwork, NetTx, NodeIdentity, Subnet, SubnetEvent, SubnetKeys, ADDR_ALL_NODES,
    ADDR_UNASSIGNED,
};
use mesh_proxy::proxy::identity::{self, ProxyServiceData};
use mesh_proxy::proxy::{AdvMode, FilterMode, ProxyConfig, ProxyError, ProxyServer, ProxyService};

use rand::rngs::StdRng;
use rand::SeedableRng;

const PRIMARY: u16 = 0x0A01;

type Server = ProxyServer<SimTransport, SimNetwork, StdRng>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn subnet_keys(tag: u8) -> SubnetKeys {
    SubnetKeys {
        net_id: [tag; 8],
        identity: [tag.wrapping_add(0x80); 16],
    }
}

fn make_server(config: ProxyConfig, subnets: &[u16]) -> (Server, SimTransport) {
    init_logging();
    let transport = SimTransport::new();
    let mut net = SimNetwork::new(PRIMARY, 4);
    for &idx in subnets {
        assert!(net.subnets.add(Subnet::new(idx, subnet_keys(idx as u8 + 1))));
    }
    let mut server =
        ProxyServer::new(config, transport.clone(), net, StdRng::seed_from_u64(42)).unwrap();
    server.gatt_enable().unwrap();
    (server, transport)
}

/// A proxy configuration PDU as a client would write it.
fn config_write(payload: &[u8]) -> Vec<u8> {
    let tx = NetTx {
        net_idx: 0,
        src: 0x0123,
        dst: ADDR_UNASSIGNED,
        ttl: 0,
    };
    let mut pdu = vec![0x02];
    pdu.extend(SimNetwork::encode_plain(&tx, payload));
    pdu
}

/// Decoded Filter Status payload from the last notification to `handle`.
fn last_status(transport: &SimTransport, handle: u16) -> Vec<u8> {
    let sent = transport.notifications_for(handle);
    let last = sent.last().expect("no notifications");
    assert_eq!(last[0], 0x02, "not a configuration PDU");
    let rx = SimNetwork::decode_plain(&last[1..]).unwrap();
    assert_eq!(rx.src, PRIMARY);
    assert_eq!(rx.dst, ADDR_UNASSIGNED);
    rx.payload
}

fn service_data(transport: &SimTransport) -> Vec<u8> {
    let adv = transport.last_advertisement().expect("not advertising");
    adv.ad
        .into_iter()
        .find(|s| s.ad_type == AD_SVC_DATA16)
        .expect("no service data")
        .data
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_subscribe_without_filter_sends_beacons_once() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0, 1, 2]);

    server.on_connect(7, ConnRole::Peripheral).unwrap();
    server.on_subscribe(7).unwrap();
    server.run_pending();

    let client = server.clients().find(7).unwrap();
    assert_eq!(client.filter.mode(), FilterMode::Allow);
    assert!(client.filter.is_empty());
    assert_eq!(transport.notifications_for(7).len(), 3);

    // A second subscription does not repeat the burst.
    server.on_subscribe(7).unwrap();
    server.run_pending();
    assert_eq!(transport.notifications_for(7).len(), 3);
}

#[test]
fn test_deny_then_add_reports_one_address() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0]);
    server.on_connect(1, ConnRole::Peripheral).unwrap();

    server.on_data_in(1, &config_write(&[0x00, 0x01])).unwrap();
    assert_eq!(last_status(&transport, 1), vec![0x03, 0x01, 0x00, 0x00]);

    server.on_data_in(1, &config_write(&[0x01, 0x12, 0x34])).unwrap();
    assert_eq!(last_status(&transport, 1), vec![0x03, 0x01, 0x00, 0x01]);

    // Denied destinations are not relayed; everything else is.
    assert!(!server.relay(&[0xEE; 8], 0x1234));
    assert!(server.relay(&[0xEE; 8], 0x1235));
}

#[test]
fn test_add_unassigned_and_odd_tail() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0]);
    server.on_connect(1, ConnRole::Peripheral).unwrap();
    server.on_data_in(1, &config_write(&[0x00, 0x00])).unwrap();

    server.on_data_in(1, &config_write(&[0x01, 0x00, 0x00])).unwrap();
    assert_eq!(last_status(&transport, 1), vec![0x03, 0x00, 0x00, 0x00]);

    // The trailing odd byte is dropped; the status still goes out.
    server
        .on_data_in(1, &config_write(&[0x01, 0xC0, 0x01, 0x77]))
        .unwrap();
    assert_eq!(last_status(&transport, 1), vec![0x03, 0x00, 0x00, 0x01]);
}

#[test]
fn test_invalid_filter_type_still_reports_status() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0]);
    server.on_connect(1, ConnRole::Peripheral).unwrap();
    server.on_data_in(1, &config_write(&[0x00, 0x00])).unwrap();
    server.on_data_in(1, &config_write(&[0x01, 0x00, 0x05])).unwrap();

    server.on_data_in(1, &config_write(&[0x00, 0x02])).unwrap();
    assert_eq!(last_status(&transport, 1), vec![0x03, 0x00, 0x00, 0x01]);

    // Unknown opcodes get no answer.
    let before = transport.notifications_for(1).len();
    server.on_data_in(1, &config_write(&[0x07])).unwrap();
    assert_eq!(transport.notifications_for(1).len(), before);
}

#[test]
fn test_full_table_rejects_new_connection() {
    let (mut server, transport) = make_server(
        ProxyConfig {
            max_connections: 2,
            ..Default::default()
        },
        &[0],
    );
    server.on_connect(1, ConnRole::Peripheral).unwrap();
    server.on_connect(2, ConnRole::Peripheral).unwrap();
    server.on_subscribe(1).unwrap();

    assert!(matches!(
        server.on_connect(3, ConnRole::Peripheral),
        Err(ProxyError::NoFreeClient)
    ));
    assert_eq!(server.clients().handles(), vec![1, 2]);
    assert_eq!(
        server.clients().find(1).unwrap().filter.mode(),
        FilterMode::Allow
    );

    assert!(matches!(
        server.adv_start(),
        Err(ProxyError::ConnectionLimit(2))
    ));
    assert!(transport.advertisements().is_empty());

    // A disconnect frees the slot for a fresh client.
    server.on_disconnect(1, 0x13).unwrap();
    server.on_connect(3, ConnRole::Peripheral).unwrap();
    let client = server.clients().find(3).unwrap();
    assert_eq!(client.filter.mode(), FilterMode::Unset);
    assert!(client.filter.is_empty());
}

#[test]
fn test_relay_leaves_caller_pdu_untouched() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0]);
    for handle in 1..=3 {
        server.on_connect(handle, ConnRole::Peripheral).unwrap();
        server.on_subscribe(handle).unwrap();
    }
    server.run_pending();
    transport.take_notifications();
    transport.fail_notify(2);

    let pdu: Vec<u8> = (0..40).collect();
    let original = pdu.clone();
    assert!(server.relay(&pdu, ADDR_ALL_NODES));
    assert_eq!(pdu, original);

    // 40 bytes over a 20-byte notification: 19 + 19 + 2.
    for handle in [1, 3] {
        let segs = transport.notifications_for(handle);
        assert_eq!(segs.len(), 3);
        let mut joined = Vec::new();
        for seg in &segs {
            joined.extend_from_slice(&seg[1..]);
        }
        assert_eq!(joined, original);
    }
    assert!(transport.notifications_for(2).is_empty());
}

#[test]
fn test_larger_mtu_avoids_segmentation() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0]);
    transport.set_mtu(1, 69);
    server.on_connect(1, ConnRole::Peripheral).unwrap();

    assert!(server.relay(&[0u8; 40], ADDR_ALL_NODES));
    let segs = transport.notifications_for(1);
    assert_eq!(segs.len(), 1);
    assert_eq!(segs[0][0], 0x00);
}

#[test]
fn test_segmented_network_pdu_from_client() {
    let (mut server, _) = make_server(ProxyConfig::default(), &[0]);
    server.on_connect(1, ConnRole::Peripheral).unwrap();
    server.on_subscribe(1).unwrap();

    let tx = NetTx {
        net_idx: 0,
        src: 0x0456,
        dst: 0xC001,
        ttl: 3,
    };
    let pdu = SimNetwork::encode_plain(&tx, &[0x5A; 20]);
    server.on_data_in(1, &[&[0x40][..], &pdu[..10]].concat()).unwrap();
    assert!(server.clients().find(1).unwrap().rx.is_pending());
    server.on_data_in(1, &[&[0xC0][..], &pdu[10..]].concat()).unwrap();

    let (_, rx) = server.net().received.last().unwrap();
    assert_eq!(rx.src, 0x0456);
    assert_eq!(rx.payload, vec![0x5A; 20]);
    assert!(server.clients().find(1).unwrap().filter.contains(0x0456));
}

#[tokio::test(start_paused = true)]
async fn test_rotation_budget_and_identity_expiry() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0, 1, 2]);
    server.identity_start(1).unwrap();

    let plan = server.adv_start().unwrap();
    assert_eq!(plan.net_idx, 1);
    assert_eq!(plan.mode, AdvMode::NodeIdentity);
    assert_eq!(plan.duration, Some(Duration::from_secs(10)));
    assert_eq!(
        transport.last_advertisement().unwrap().params,
        AdvParams::fast()
    );

    let plan = server.adv_start().unwrap();
    assert_eq!((plan.net_idx, plan.mode), (2, AdvMode::NetworkId));
    let plan = server.adv_start().unwrap();
    assert_eq!((plan.net_idx, plan.mode), (0, AdvMode::NetworkId));

    tokio::time::advance(Duration::from_secs(60)).await;

    let plan = server.adv_start().unwrap();
    assert_eq!((plan.net_idx, plan.mode), (1, AdvMode::NetworkId));
    assert_eq!(
        server.net().subnets().get(1).unwrap().node_id,
        NodeIdentity::Stopped
    );
}

#[test]
fn test_node_identity_payload_rotates() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0]);
    server.identity_start(0).unwrap();

    server.adv_start().unwrap();
    let first = service_data(&transport);
    server.adv_start().unwrap();
    let second = service_data(&transport);

    assert_eq!(first.len(), identity::NODE_ID_LEN);
    assert_ne!(first, second);

    let key = subnet_keys(1).identity;
    for data in [&first, &second] {
        assert!(matches!(
            identity::parse_service_data(data),
            Some(ProxyServiceData::NodeIdentity { .. })
        ));
        assert!(identity::verify_node_identity(data, &key, PRIMARY));
    }

    // The envelope fits a legacy advertisement.
    let adv = transport.last_advertisement().unwrap();
    assert!(adv::encode(&adv.ad).len() <= 31);
}

#[test]
fn test_key_refresh_advertises_new_network_id() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0]);
    {
        let sub = server.net_mut().subnets.get_mut(0).unwrap();
        sub.keys[1] = subnet_keys(0x20);
        sub.kr_phase = mesh_proxy::mesh::KeyRefreshPhase::Phase2;
    }

    server.adv_start().unwrap();
    assert_eq!(
        identity::parse_service_data(&service_data(&transport)),
        Some(ProxyServiceData::NetworkId([0x20; 8]))
    );
}

#[test]
fn test_subnet_added_sends_beacon_to_clients() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0]);
    server.on_connect(1, ConnRole::Peripheral).unwrap();
    server.on_connect(2, ConnRole::Peripheral).unwrap();

    server
        .net_mut()
        .subnets
        .add(Subnet::new(5, subnet_keys(9)));
    server.subnet_event(5, SubnetEvent::Added);

    let sent = transport.notifications();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(_, pdu)| pdu[0] == 0x01 && pdu[3..] == [9u8; 8]));

    server.beacon_send_all();
    assert_eq!(transport.notifications().len(), 6);
}

#[test]
fn test_gatt_disable_drops_configured_clients() {
    let (mut server, transport) = make_server(ProxyConfig::default(), &[0]);
    server.on_connect(1, ConnRole::Peripheral).unwrap();
    server.on_connect(2, ConnRole::Peripheral).unwrap();
    server.on_data_in(2, &config_write(&[0x00, 0x01])).unwrap();

    server.adv_start().unwrap();
    assert!(transport.is_advertising());

    server.gatt_disable().unwrap();
    assert_eq!(transport.terminated(), vec![(2, REASON_REMOTE_USER_TERM)]);
    assert!(!transport.is_advertising());
    assert!(!transport.service_visible());
    assert!(matches!(server.adv_start(), Err(ProxyError::NotSupported)));

    server.on_connect(9, ConnRole::Peripheral).unwrap();
    assert!(server.clients().find(9).is_none());
}

#[test]
fn test_config_from_json_drives_server() {
    let config = ProxyConfig::from_json(
        r#"{"max_connections": 1, "filter_size": 2, "device_name": "proxy-1"}"#,
    )
    .unwrap();
    let (mut server, transport) = make_server(config, &[0]);
    server.on_connect(1, ConnRole::Peripheral).unwrap();
    server.on_data_in(1, &config_write(&[0x00, 0x00])).unwrap();

    server
        .on_data_in(1, &config_write(&[0x01, 0xC0, 0x01, 0xC0, 0x02, 0xC0, 0x03]))
        .unwrap();
    assert_eq!(last_status(&transport, 1), vec![0x03, 0x00, 0x00, 0x02]);
}

// ---------------------------------------------------------------------------
// Service loop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_service_sar_timeout_and_reconnect() {
    let (server, transport) = make_server(ProxyConfig::default(), &[0]);
    let (proxy, task) = ProxyService::spawn(server);

    proxy.connected(4, ConnRole::Peripheral).await.unwrap();
    proxy.subscribed(4).await.unwrap();
    proxy.data_in(4, vec![0x40, 0x00, 0x01]).await.unwrap();

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(transport.terminated(), vec![(4, REASON_REMOTE_USER_TERM)]);

    proxy.disconnected(4, REASON_REMOTE_USER_TERM).await.unwrap();
    proxy.connected(4, ConnRole::Peripheral).await.unwrap();
    assert_eq!(proxy.clients().await.unwrap(), vec![4]);

    let plan = proxy.adv_start().await.unwrap();
    assert_eq!(plan.mode, AdvMode::NetworkId);

    proxy.shutdown().await.unwrap();
    let server = task.await.unwrap();
    let client = server.clients().find(4).unwrap();
    assert!(!client.rx.is_pending());
    assert_eq!(client.filter.mode(), FilterMode::Unset);
}
