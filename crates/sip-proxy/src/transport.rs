//! In-process transport adapter.
//!
//! Shuffles messages between the public per-direction queues and the
//! transaction layer, cloning nothing but fixing Content-Length at each
//! boundary so no component ever sees a stale value.

use sip_msg::SipMessage;
use sip_txn::{Direction, TransportEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) struct TransportAdapter {
    pub client_out: mpsc::Sender<SipMessage>,
    pub server_out: mpsc::Sender<SipMessage>,
    pub to_txn: mpsc::Sender<TransportEvent>,
    pub shutdown: CancellationToken,
}

impl TransportAdapter {
    pub async fn run(
        self,
        mut client_in: mpsc::Receiver<SipMessage>,
        mut server_in: mpsc::Receiver<SipMessage>,
        mut from_txn: mpsc::Receiver<TransportEvent>,
    ) {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                msg = client_in.recv() => match msg {
                    Some(msg) => self.inbound(Direction::Downstream, msg).await,
                    None => return,
                },
                msg = server_in.recv() => match msg {
                    Some(msg) => self.inbound(Direction::Upstream, msg).await,
                    None => return,
                },
                evt = from_txn.recv() => match evt {
                    Some(evt) => self.outbound(evt).await,
                    None => return,
                },
            }
        }
    }

    async fn inbound(&self, direction: Direction, mut message: SipMessage) {
        message.ensure_content_length();
        let evt = TransportEvent { direction, message };
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            sent = self.to_txn.send(evt) => {
                if sent.is_err() {
                    debug!("transaction queue closed; dropping inbound message");
                }
            }
        }
    }

    async fn outbound(&self, evt: TransportEvent) {
        let mut message = evt.message;
        message.ensure_content_length();
        let queue = match evt.direction {
            Direction::Downstream => &self.client_out,
            Direction::Upstream => &self.server_out,
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            sent = queue.send(message) => {
                if sent.is_err() {
                    debug!("outbound queue closed; dropping message");
                }
            }
        }
    }
}
