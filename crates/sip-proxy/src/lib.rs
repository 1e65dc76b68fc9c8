// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stateful SIP proxy core.
//!
//! [`Proxy`] wires the in-process transport adapter, the transaction layer,
//! and the transaction user into a pipeline of bounded queues, one task per
//! stage. Callers feed parsed messages in per direction and drain outbound
//! messages per direction; the network side lives in the daemon.

use std::sync::Arc;
use std::time::Duration;

use sip_msg::SipMessage;
use sip_registrar::Registrar;
use sip_txn::{Clock, SystemClock, TimerConfig, TransactionLayer};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod broadcast;
pub mod policy;
pub mod transport;
pub mod tu;

pub use policy::{BroadcastPolicy, BroadcastRule};
pub use tu::{TransactionUser, PROXY_VIA_HOST};

const QUEUE_DEPTH: usize = 32;

/// Construction options for [`Proxy`].
pub struct ProxyConfig {
    pub timers: TimerConfig,
    pub registrar: Option<Arc<Registrar>>,
    pub broadcast: Option<Arc<BroadcastPolicy>>,
    pub clock: Arc<dyn Clock>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timers: TimerConfig::default(),
            registrar: None,
            broadcast: None,
            clock: Arc::new(SystemClock),
        }
    }
}

/// A running stateful proxy: three tasks connected by per-direction queues.
pub struct Proxy {
    client_in: mpsc::Sender<SipMessage>,
    server_in: mpsc::Sender<SipMessage>,
    client_out: Mutex<mpsc::Receiver<SipMessage>>,
    server_out: Mutex<mpsc::Receiver<SipMessage>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Proxy {
    /// Builds and starts a proxy with the provided policy components.
    pub fn new(config: ProxyConfig) -> Self {
        let shutdown = CancellationToken::new();

        let (client_in_tx, client_in_rx) = mpsc::channel(QUEUE_DEPTH);
        let (server_in_tx, server_in_rx) = mpsc::channel(QUEUE_DEPTH);
        let (client_out_tx, client_out_rx) = mpsc::channel(QUEUE_DEPTH);
        let (server_out_tx, server_out_rx) = mpsc::channel(QUEUE_DEPTH);

        let (transport_to_txn_tx, transport_to_txn_rx) = mpsc::channel(QUEUE_DEPTH);
        let (txn_to_transport_tx, txn_to_transport_rx) = mpsc::channel(QUEUE_DEPTH);
        let (txn_to_tu_tx, txn_to_tu_rx) = mpsc::channel(QUEUE_DEPTH);
        let (tu_to_txn_tx, tu_to_txn_rx) = mpsc::channel(QUEUE_DEPTH);

        let adapter = transport::TransportAdapter {
            client_out: client_out_tx,
            server_out: server_out_tx,
            to_txn: transport_to_txn_tx,
            shutdown: shutdown.clone(),
        };
        let layer = TransactionLayer::new(
            txn_to_transport_tx,
            txn_to_tu_tx,
            config.timers,
            config.clock,
            shutdown.clone(),
        );
        let user = TransactionUser::new(
            tu_to_txn_tx,
            config.registrar,
            config.broadcast,
            shutdown.clone(),
        );

        let tasks = vec![
            tokio::spawn(adapter.run(client_in_rx, server_in_rx, txn_to_transport_rx)),
            tokio::spawn(layer.run(transport_to_txn_rx, tu_to_txn_rx)),
            tokio::spawn(user.run(txn_to_tu_rx)),
        ];

        Self {
            client_in: client_in_tx,
            server_in: server_in_tx,
            client_out: Mutex::new(client_out_rx),
            server_out: Mutex::new(server_out_rx),
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    /// Enqueues a message received from a downstream client.
    pub async fn send_from_client(&self, message: SipMessage) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            sent = self.client_in.send(message) => {
                if sent.is_err() {
                    debug!("proxy stopped; dropping downstream message");
                }
            }
        }
    }

    /// Enqueues a message received from an upstream server.
    pub async fn send_from_server(&self, message: SipMessage) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            sent = self.server_in.send(message) => {
                if sent.is_err() {
                    debug!("proxy stopped; dropping upstream message");
                }
            }
        }
    }

    /// Next message bound for the downstream side, or `None` on timeout or
    /// shutdown.
    pub async fn next_to_client(&self, timeout: Duration) -> Option<SipMessage> {
        let mut queue = self.client_out.lock().await;
        tokio::time::timeout(timeout, queue.recv()).await.ok()?
    }

    /// Next message bound for the upstream side, or `None` on timeout or
    /// shutdown.
    pub async fn next_to_server(&self, timeout: Duration) -> Option<SipMessage> {
        let mut queue = self.server_out.lock().await;
        tokio::time::timeout(timeout, queue.recv()).await.ok()?
    }

    /// Cancels the pipeline and waits for every stage to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}
