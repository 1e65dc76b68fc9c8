// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! UDP transport glue around the proxy core.
//!
//! Four IO loops: two socket readers feeding the proxy per direction, and
//! two senders draining it. The downstream reader remembers each request's
//! origin in the route memory; the downstream sender replies there. The
//! upstream sender resolves a fresh target per request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use sip_msg::{parse_message, serialize_message};
use sip_proxy::Proxy;
use sip_registrar::Registrar;
use sip_routing::{route_key, RouteMemory, UpstreamResolver};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECV_BUFFER: usize = 64 * 1024;
const DRAIN_POLL: Duration = Duration::from_millis(250);

pub struct StackConfig {
    pub listen: String,
    pub upstream_bind: String,
}

/// The running transport side: sockets plus IO tasks.
pub struct SipStack {
    tasks: Vec<JoinHandle<()>>,
}

impl SipStack {
    /// Binds both sockets and starts the IO loops.
    pub async fn start(
        config: StackConfig,
        proxy: Arc<Proxy>,
        resolver: Arc<UpstreamResolver<Arc<Registrar>>>,
        routes: Arc<RouteMemory>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let downstream = Arc::new(
            UdpSocket::bind(&config.listen)
                .await
                .with_context(|| format!("listen on {}", config.listen))?,
        );
        let upstream = Arc::new(
            UdpSocket::bind(&config.upstream_bind)
                .await
                .with_context(|| format!("open upstream socket on {}", config.upstream_bind))?,
        );
        info!(
            downstream = %downstream.local_addr()?,
            upstream = %upstream.local_addr()?,
            "SIP stack listening"
        );

        let tasks = vec![
            tokio::spawn(run_downstream_reader(
                Arc::clone(&downstream),
                Arc::clone(&proxy),
                Arc::clone(&routes),
                shutdown.clone(),
            )),
            tokio::spawn(run_upstream_reader(
                Arc::clone(&upstream),
                Arc::clone(&proxy),
                shutdown.clone(),
            )),
            tokio::spawn(run_upstream_sender(
                Arc::clone(&upstream),
                Arc::clone(&proxy),
                resolver,
                shutdown.clone(),
            )),
            tokio::spawn(run_downstream_sender(
                downstream,
                Arc::clone(&proxy),
                Arc::clone(&routes),
                shutdown.clone(),
            )),
            tokio::spawn(async move {
                routes.run_cleanup(shutdown).await;
            }),
        ];

        Ok(Self { tasks })
    }

    /// Waits for every IO loop to exit.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn run_downstream_reader(
    socket: Arc<UdpSocket>,
    proxy: Arc<Proxy>,
    routes: Arc<RouteMemory>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "error reading from downstream");
                    continue;
                }
            },
        };
        let datagram = Bytes::copy_from_slice(&buf[..len]);
        let msg = match parse_message(&datagram) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(peer = %peer, error = %err, "discarding invalid downstream datagram");
                continue;
            }
        };
        if msg.is_request() {
            if let Some(key) = route_key(&msg) {
                routes.remember(key, peer);
            }
        }
        proxy.send_from_client(msg).await;
    }
}

async fn run_upstream_reader(
    socket: Arc<UdpSocket>,
    proxy: Arc<Proxy>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "error reading from upstream");
                    continue;
                }
            },
        };
        let datagram = Bytes::copy_from_slice(&buf[..len]);
        match parse_message(&datagram) {
            Ok(msg) => proxy.send_from_server(msg).await,
            Err(err) => {
                debug!(peer = %peer, error = %err, "discarding invalid upstream datagram");
            }
        }
    }
}

async fn run_upstream_sender(
    socket: Arc<UdpSocket>,
    proxy: Arc<Proxy>,
    resolver: Arc<UpstreamResolver<Arc<Registrar>>>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = match proxy.next_to_server(DRAIN_POLL).await {
            Some(msg) => msg,
            None => {
                if shutdown.is_cancelled() {
                    return;
                }
                continue;
            }
        };
        let addr = match resolver.resolve(&msg).await {
            Some(addr) => addr,
            None => {
                warn!(message = %msg.summary(), "no upstream target; dropping message");
                continue;
            }
        };
        send_datagram(&socket, &serialize_message(&msg), addr, "upstream").await;
    }
}

async fn run_downstream_sender(
    socket: Arc<UdpSocket>,
    proxy: Arc<Proxy>,
    routes: Arc<RouteMemory>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = match proxy.next_to_client(DRAIN_POLL).await {
            Some(msg) => msg,
            None => {
                if shutdown.is_cancelled() {
                    return;
                }
                continue;
            }
        };
        let key = match route_key(&msg) {
            Some(key) => key,
            None => {
                warn!(message = %msg.summary(), "dropping downstream message without transaction key");
                continue;
            }
        };
        let addr = match routes.lookup(&key) {
            Some(addr) => addr,
            None => {
                warn!(key = %key, "no downstream route for transaction; dropping message");
                continue;
            }
        };
        send_datagram(&socket, &serialize_message(&msg), addr, "downstream").await;
    }
}

async fn send_datagram(socket: &UdpSocket, payload: &Bytes, addr: SocketAddr, side: &str) {
    if let Err(err) = socket.send_to(payload.as_ref(), addr).await {
        warn!(peer = %addr, side, error = %err, "failed to send datagram");
    }
}
