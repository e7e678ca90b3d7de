//! Serialized event loop around [`ProxyServer`]
//!
//! One spawned task owns the server. Transport callbacks, network-layer
//! requests and advertising ticks arrive as [`ProxyEvent`]s on an mpsc
//! channel and are handled one at a time, in arrival order. Deferred tasks
//! run after each event, and the loop wakes on its own when the earliest SAR
//! deadline passes.

use rand::RngCore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::ble::transport::ProxyTransport;
use crate::ble::{ConnHandle, ConnRole};
use crate::mesh::{MeshNetwork, SubnetEvent};

use super::rotation::AdvPlan;
use super::server::ProxyServer;
use super::ProxyError;

const EVENT_QUEUE_DEPTH: usize = 64;

type Reply<V> = oneshot::Sender<V>;

pub enum ProxyEvent {
    Connected { handle: ConnHandle, role: ConnRole },
    Disconnected { handle: ConnHandle, reason: u8 },
    Subscribed { handle: ConnHandle },
    DataIn { handle: ConnHandle, pdu: Vec<u8> },
    Relay { pdu: Vec<u8>, dst: u16, reply: Reply<bool> },
    Subnet { net_idx: u16, event: SubnetEvent },
    BeaconSendAll,
    AdvStart { reply: Reply<Result<AdvPlan, ProxyError>> },
    IdentityStart { net_idx: u16, reply: Reply<Result<(), ProxyError>> },
    IdentityStop { net_idx: u16, reply: Reply<Result<(), ProxyError>> },
    IdentityEnable { reply: Reply<Result<(), ProxyError>> },
    IdentityDisable,
    GattEnable { reply: Reply<Result<(), ProxyError>> },
    GattDisable { reply: Reply<Result<(), ProxyError>> },
    /// Handles of the connected proxy clients.
    Clients { reply: Reply<Vec<ConnHandle>> },
    Shutdown,
}

pub struct ProxyService;

impl ProxyService {
    /// Move `server` into a new task. The join handle yields the server
    /// back after shutdown.
    pub fn spawn<T, N, R>(
        server: ProxyServer<T, N, R>,
    ) -> (ProxyHandle, JoinHandle<ProxyServer<T, N, R>>)
    where
        T: ProxyTransport + Send + 'static,
        N: MeshNetwork + Send + 'static,
        R: RngCore + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let task = tokio::spawn(Self::run(server, rx));
        (ProxyHandle { tx }, task)
    }

    async fn run<T, N, R>(
        mut server: ProxyServer<T, N, R>,
        mut rx: mpsc::Receiver<ProxyEvent>,
    ) -> ProxyServer<T, N, R>
    where
        T: ProxyTransport,
        N: MeshNetwork,
        R: RngCore,
    {
        loop {
            let deadline = server.next_deadline();
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(ProxyEvent::Shutdown) | None => break,
                        Some(event) => Self::handle(&mut server, event),
                    }
                }
                _ = sleep_until(deadline) => {
                    server.poll_timeouts(Instant::now());
                }
            }
            server.run_pending();
        }

        log::debug!("proxy service stopped");
        server
    }

    fn handle<T, N, R>(server: &mut ProxyServer<T, N, R>, event: ProxyEvent)
    where
        T: ProxyTransport,
        N: MeshNetwork,
        R: RngCore,
    {
        // Failures are logged by the server; replies carry them to callers
        // that asked.
        match event {
            ProxyEvent::Connected { handle, role } => {
                let _ = server.on_connect(handle, role);
            }
            ProxyEvent::Disconnected { handle, reason } => {
                let _ = server.on_disconnect(handle, reason);
            }
            ProxyEvent::Subscribed { handle } => {
                let _ = server.on_subscribe(handle);
            }
            ProxyEvent::DataIn { handle, pdu } => {
                let _ = server.on_data_in(handle, &pdu);
            }
            ProxyEvent::Relay { pdu, dst, reply } => {
                let _ = reply.send(server.relay(&pdu, dst));
            }
            ProxyEvent::Subnet { net_idx, event } => server.subnet_event(net_idx, event),
            ProxyEvent::BeaconSendAll => server.beacon_send_all(),
            ProxyEvent::AdvStart { reply } => {
                let _ = reply.send(server.adv_start());
            }
            ProxyEvent::IdentityStart { net_idx, reply } => {
                let _ = reply.send(server.identity_start(net_idx));
            }
            ProxyEvent::IdentityStop { net_idx, reply } => {
                let _ = reply.send(server.identity_stop(net_idx));
            }
            ProxyEvent::IdentityEnable { reply } => {
                let _ = reply.send(server.identity_enable());
            }
            ProxyEvent::IdentityDisable => server.identity_disable(),
            ProxyEvent::GattEnable { reply } => {
                let _ = reply.send(server.gatt_enable());
            }
            ProxyEvent::GattDisable { reply } => {
                let _ = reply.send(server.gatt_disable());
            }
            ProxyEvent::Clients { reply } => {
                let _ = reply.send(server.clients().handles());
            }
            ProxyEvent::Shutdown => {}
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable sender side of a running [`ProxyService`].
#[derive(Clone)]
pub struct ProxyHandle {
    tx: mpsc::Sender<ProxyEvent>,
}

impl ProxyHandle {
    async fn post(&self, event: ProxyEvent) -> Result<(), ProxyError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ProxyError::ServiceStopped)
    }

    async fn request<V>(
        &self,
        event: impl FnOnce(Reply<V>) -> ProxyEvent,
    ) -> Result<V, ProxyError> {
        let (reply, response) = oneshot::channel();
        self.post(event(reply)).await?;
        response.await.map_err(|_| ProxyError::ServiceStopped)
    }

    pub async fn connected(&self, handle: ConnHandle, role: ConnRole) -> Result<(), ProxyError> {
        self.post(ProxyEvent::Connected { handle, role }).await
    }

    pub async fn disconnected(&self, handle: ConnHandle, reason: u8) -> Result<(), ProxyError> {
        self.post(ProxyEvent::Disconnected { handle, reason }).await
    }

    pub async fn subscribed(&self, handle: ConnHandle) -> Result<(), ProxyError> {
        self.post(ProxyEvent::Subscribed { handle }).await
    }

    pub async fn data_in(&self, handle: ConnHandle, pdu: Vec<u8>) -> Result<(), ProxyError> {
        self.post(ProxyEvent::DataIn { handle, pdu }).await
    }

    pub async fn relay(&self, pdu: Vec<u8>, dst: u16) -> Result<bool, ProxyError> {
        self.request(|reply| ProxyEvent::Relay { pdu, dst, reply })
            .await
    }

    pub async fn subnet_event(&self, net_idx: u16, event: SubnetEvent) -> Result<(), ProxyError> {
        self.post(ProxyEvent::Subnet { net_idx, event }).await
    }

    pub async fn beacon_send_all(&self) -> Result<(), ProxyError> {
        self.post(ProxyEvent::BeaconSendAll).await
    }

    pub async fn adv_start(&self) -> Result<AdvPlan, ProxyError> {
        self.request(|reply| ProxyEvent::AdvStart { reply }).await?
    }

    pub async fn identity_start(&self, net_idx: u16) -> Result<(), ProxyError> {
        self.request(|reply| ProxyEvent::IdentityStart { net_idx, reply })
            .await?
    }

    pub async fn identity_stop(&self, net_idx: u16) -> Result<(), ProxyError> {
        self.request(|reply| ProxyEvent::IdentityStop { net_idx, reply })
            .await?
    }

    pub async fn identity_enable(&self) -> Result<(), ProxyError> {
        self.request(|reply| ProxyEvent::IdentityEnable { reply }).await?
    }

    pub async fn identity_disable(&self) -> Result<(), ProxyError> {
        self.post(ProxyEvent::IdentityDisable).await
    }

    pub async fn gatt_enable(&self) -> Result<(), ProxyError> {
        self.request(|reply| ProxyEvent::GattEnable { reply }).await?
    }

    pub async fn gatt_disable(&self) -> Result<(), ProxyError> {
        self.request(|reply| ProxyEvent::GattDisable { reply }).await?
    }

    pub async fn clients(&self) -> Result<Vec<ConnHandle>, ProxyError> {
        self.request(|reply| ProxyEvent::Clients { reply }).await
    }

    /// Stop the service. Events already queued are dropped.
    pub async fn shutdown(&self) -> Result<(), ProxyError> {
        self.post(ProxyEvent::Shutdown).await
    }
}
