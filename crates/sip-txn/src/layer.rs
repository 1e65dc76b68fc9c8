// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction layer task.
//!
//! One task multiplexes transport events, TU actions, and the periodic sweep
//! tick; both transaction maps are owned by that task and never locked.
//! Per-entry timers are absolute [`Instant`]s compared with `now >= deadline`
//! on each tick, so coarse ticks and paused clocks are tolerated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sip_msg::{
    copy_headers, cseq_method, cseq_number, format_cseq, via_branch, Method, Request, Response,
    SipMessage, StatusLine,
};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::fsm::{ClientMachine, ServerMachine};
use crate::{generate_branch, Direction, TimerConfig, TransportEvent, TuAction, TuEvent, TxnKey};

/// Message state shared by every transaction entry.
struct TxnData {
    request: Request,
    last_response: Option<Response>,
}

/// One request accepted from downstream.
struct ServerEntry {
    machine: ServerMachine,
    data: TxnData,
    /// Retention horizon for retransmission caching.
    expires: Instant,
    /// Termination deadline (timer H, I, or J once armed).
    deadline: Option<Instant>,
    /// Next timer-G retransmission, when armed.
    retransmit_at: Option<Instant>,
    retransmit_interval: Duration,
}

/// One request the proxy sent upstream.
struct ClientEntry {
    machine: ClientMachine,
    data: TxnData,
    server_tx: TxnKey,
    /// Timer B (INVITE) or F (non-INVITE).
    deadline: Option<Instant>,
    /// Next timer-A/E retransmission, when armed.
    retransmit_at: Option<Instant>,
    retransmit_interval: Duration,
    /// Timer D (INVITE failure wait) or K (non-INVITE wait).
    terminate_at: Option<Instant>,
    /// Timer C proceeding guard, INVITE only.
    timer_c_at: Option<Instant>,
}

/// Owns the server and client transaction registries and drives their timers.
pub struct TransactionLayer {
    to_transport: mpsc::Sender<TransportEvent>,
    to_tu: mpsc::Sender<TuEvent>,
    server_txns: HashMap<TxnKey, ServerEntry>,
    client_txns: HashMap<TxnKey, ClientEntry>,
    config: TimerConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl TransactionLayer {
    pub fn new(
        to_transport: mpsc::Sender<TransportEvent>,
        to_tu: mpsc::Sender<TuEvent>,
        config: TimerConfig,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            to_transport,
            to_tu,
            server_txns: HashMap::new(),
            client_txns: HashMap::new(),
            config,
            clock,
            shutdown,
        }
    }

    /// Runs the layer until shutdown or until both input queues close.
    pub async fn run(
        mut self,
        mut from_transport: mpsc::Receiver<TransportEvent>,
        mut from_tu: mpsc::Receiver<TuAction>,
    ) {
        let shutdown = self.shutdown.clone();
        let mut tick = tokio::time::interval(self.config.cleanup_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => {
                    let now = self.clock.now();
                    self.sweep(now).await;
                }
                evt = from_transport.recv() => match evt {
                    Some(evt) => self.handle_transport_event(evt).await,
                    None => return,
                },
                action = from_tu.recv() => match action {
                    Some(action) => self.handle_tu_action(action).await,
                    None => return,
                },
            }
        }
    }

    pub fn server_transaction_count(&self) -> usize {
        self.server_txns.len()
    }

    pub fn client_transaction_count(&self) -> usize {
        self.client_txns.len()
    }

    pub(crate) async fn handle_transport_event(&mut self, evt: TransportEvent) {
        match evt.message {
            SipMessage::Request(request) => self.handle_request(request).await,
            SipMessage::Response(response) => self.handle_response(response).await,
        }
    }

    /// Downstream inbound request: match or create the server transaction.
    async fn handle_request(&mut self, request: Request) {
        let branch = request
            .headers
            .get_all("Via")
            .next()
            .and_then(|via| via_branch(via.as_str()))
            .map(SmolStr::new);
        let branch = match branch {
            Some(branch) => branch,
            None => {
                debug!(request = %request.start.method, "rejecting request without Via branch");
                self.reject_request(&request, 400, "Missing branch").await;
                return;
            }
        };

        if request.start.method == Method::Ack {
            self.handle_ack(branch);
            return;
        }

        let key = TxnKey::new(request.start.method.clone(), branch);
        let now = self.clock.now();
        if let Some(entry) = self.server_txns.get_mut(&key) {
            // Retransmission: replay the cached response, never bother the TU.
            let cached = entry.data.last_response.clone();
            entry.expires = now + self.config.retention;
            if let Some(response) = cached {
                self.send_to_transport(Direction::Downstream, response.into())
                    .await;
            }
            return;
        }

        let entry = ServerEntry {
            machine: ServerMachine::for_method(&request.start.method),
            data: TxnData {
                request: request.clone(),
                last_response: None,
            },
            expires: now + self.config.retention,
            deadline: None,
            retransmit_at: None,
            retransmit_interval: Duration::ZERO,
        };
        self.server_txns.insert(key.clone(), entry);
        self.send_to_tu(TuEvent::Request {
            server_tx: key,
            request,
        })
        .await;
    }

    /// Upstream inbound response: match the client transaction and update
    /// its timers.
    async fn handle_response(&mut self, response: Response) {
        let branch = response
            .headers
            .get_all("Via")
            .next()
            .and_then(|via| via_branch(via.as_str()))
            .map(SmolStr::new);
        let (branch, method) = match (branch, cseq_method(&response.headers)) {
            (Some(branch), Some(method)) => (branch, Method::from_token(&method)),
            _ => {
                debug!("dropping response without branch or CSeq method");
                return;
            }
        };
        let key = TxnKey::new(method, branch);
        let now = self.clock.now();

        let (server_tx, completed) = {
            let entry = match self.client_txns.get_mut(&key) {
                Some(entry) => entry,
                None => {
                    debug!(key = %key, "dropping response for unknown client transaction");
                    return;
                }
            };
            entry.data.last_response = Some(response.clone());
            let status = response.start.code;
            let completed = entry.machine.on_receive_response(status);

            if entry.machine.is_invite() {
                entry.deadline = None;
                entry.retransmit_at = None;
                entry.retransmit_interval = Duration::ZERO;
                if status < 200 {
                    if entry.timer_c_at.is_none() {
                        entry.timer_c_at = Some(now + self.config.timer_c);
                    }
                } else {
                    entry.timer_c_at = None;
                    if status >= 300 {
                        entry.terminate_at = Some(now + self.config.timer_d);
                    }
                }
            } else if status < 200 {
                // Provisional: keep retransmitting at the capped interval.
                entry.retransmit_interval = self.config.timer_e_max;
                entry.retransmit_at = Some(now + self.config.timer_e_max);
            } else {
                entry.deadline = None;
                entry.retransmit_at = None;
                entry.retransmit_interval = Duration::ZERO;
                entry.terminate_at = Some(now + self.config.timer_k);
            }
            (entry.server_tx.clone(), completed)
        };

        if completed {
            self.client_txns.remove(&key);
        }
        self.send_to_tu(TuEvent::Response {
            server_tx,
            client_tx: key,
            response,
        })
        .await;
    }

    pub(crate) async fn handle_tu_action(&mut self, action: TuAction) {
        match action {
            TuAction::ForwardRequest {
                server_tx,
                client_tx,
                request,
            } => self.forward_request(server_tx, client_tx, request).await,
            TuAction::SendResponse {
                server_tx,
                response,
            } => self.send_response(server_tx, response).await,
        }
    }

    async fn forward_request(
        &mut self,
        server_tx: TxnKey,
        client_tx: Option<TxnKey>,
        request: Request,
    ) {
        let branch = request
            .headers
            .get_all("Via")
            .next()
            .and_then(|via| via_branch(via.as_str()))
            .map(SmolStr::new)
            .or_else(|| client_tx.as_ref().map(|key| key.branch.clone()))
            .unwrap_or_else(generate_branch);
        let method = request.start.method.clone();
        let key = client_tx.unwrap_or_else(|| TxnKey::new(method.clone(), branch));

        let now = self.clock.now();
        let mut entry = ClientEntry {
            machine: ClientMachine::for_method(&method),
            data: TxnData {
                request: request.clone(),
                last_response: None,
            },
            server_tx,
            deadline: None,
            retransmit_at: None,
            retransmit_interval: Duration::ZERO,
            terminate_at: None,
            timer_c_at: None,
        };
        if entry.machine.is_invite() {
            entry.retransmit_interval = self.config.timer_a_initial;
            entry.retransmit_at = Some(now + self.config.timer_a_initial);
            entry.deadline = Some(now + self.config.timer_b);
            entry.timer_c_at = Some(now + self.config.timer_c);
        } else {
            entry.retransmit_interval = self.config.timer_e_initial;
            entry.retransmit_at = Some(now + self.config.timer_e_initial);
            entry.deadline = Some(now + self.config.timer_f);
        }
        self.client_txns.insert(key, entry);
        self.send_to_transport(Direction::Upstream, request.into())
            .await;
    }

    async fn send_response(&mut self, server_tx: TxnKey, response: Response) {
        let now = self.clock.now();
        {
            let entry = match self.server_txns.get_mut(&server_tx) {
                Some(entry) => entry,
                None => {
                    warn!(key = %server_tx, "response for unknown server transaction");
                    return;
                }
            };
            entry.data.last_response = Some(response.clone());
            let status = response.start.code;
            entry.machine.on_send_response(status);
            entry.expires = now + self.config.retention;
            if status >= 200 {
                if entry.machine.is_invite() {
                    entry.deadline = Some(now + self.config.timer_h);
                    if status >= 300 {
                        entry.retransmit_interval = self.config.timer_g_initial;
                        entry.retransmit_at = Some(now + self.config.timer_g_initial);
                    } else {
                        entry.retransmit_interval = Duration::ZERO;
                        entry.retransmit_at = None;
                    }
                } else {
                    entry.deadline = Some(now + self.config.timer_j);
                    entry.retransmit_interval = Duration::ZERO;
                    entry.retransmit_at = None;
                }
            }
        }
        self.send_to_transport(Direction::Downstream, response.into())
            .await;
    }

    /// Matches an ACK against a completed INVITE server transaction,
    /// transitioning it to Confirmed and arming timer I. No TU notification.
    fn handle_ack(&mut self, branch: SmolStr) {
        let key = TxnKey::new(Method::Invite, branch);
        let now = self.clock.now();
        let entry = match self.server_txns.get_mut(&key) {
            Some(entry) => entry,
            None => return,
        };
        if !entry.machine.on_receive_ack() {
            return;
        }
        entry.deadline = Some(now + self.config.timer_i);
        entry.retransmit_at = None;
        entry.retransmit_interval = Duration::ZERO;
        entry.expires = now + self.config.retention;
    }

    /// Advances every per-entry timer that is due at `now`.
    pub(crate) async fn sweep(&mut self, now: Instant) {
        self.sweep_server(now).await;
        self.sweep_client(now).await;
    }

    async fn sweep_server(&mut self, now: Instant) {
        enum Act {
            Remove,
            Retransmit(Response),
            None,
        }

        let keys: Vec<TxnKey> = self.server_txns.keys().cloned().collect();
        for key in keys {
            let act = {
                let entry = match self.server_txns.get_mut(&key) {
                    Some(entry) => entry,
                    None => continue,
                };
                if entry.deadline.is_some_and(|at| now >= at) {
                    Act::Remove
                } else if entry.retransmit_at.is_some_and(|at| now >= at) {
                    match entry.data.last_response.clone() {
                        Some(response) => {
                            let next = if entry.retransmit_interval.is_zero() {
                                self.config.timer_g_initial
                            } else {
                                (entry.retransmit_interval * 2).min(self.config.timer_g_max)
                            };
                            entry.retransmit_interval = next;
                            entry.retransmit_at = Some(now + next);
                            entry.expires = now + self.config.retention;
                            Act::Retransmit(response)
                        }
                        None => {
                            entry.retransmit_at = None;
                            entry.retransmit_interval = Duration::ZERO;
                            Act::None
                        }
                    }
                } else if now > entry.expires {
                    Act::Remove
                } else {
                    Act::None
                }
            };
            match act {
                Act::Remove => {
                    self.server_txns.remove(&key);
                }
                Act::Retransmit(response) => {
                    self.send_to_transport(Direction::Downstream, response.into())
                        .await;
                }
                Act::None => {}
            }
        }
    }

    async fn sweep_client(&mut self, now: Instant) {
        enum Act {
            Timeout {
                server_tx: TxnKey,
                response: Response,
            },
            TimerC {
                server_tx: TxnKey,
                cancel: Request,
                response: Response,
            },
            Retransmit(Request),
            Terminate,
            None,
        }

        let keys: Vec<TxnKey> = self.client_txns.keys().cloned().collect();
        for key in keys {
            let act = {
                let entry = match self.client_txns.get_mut(&key) {
                    Some(entry) => entry,
                    None => continue,
                };
                if entry.deadline.is_some_and(|at| now >= at) {
                    entry.machine.on_timeout();
                    Act::Timeout {
                        server_tx: entry.server_tx.clone(),
                        response: timeout_response(&entry.data.request),
                    }
                } else if entry.timer_c_at.is_some_and(|at| now >= at) {
                    entry.machine.on_timeout();
                    Act::TimerC {
                        server_tx: entry.server_tx.clone(),
                        cancel: cancel_from_request(&entry.data.request),
                        response: timeout_response(&entry.data.request),
                    }
                } else if entry.retransmit_at.is_some_and(|at| now >= at) {
                    let (start, cap) = if entry.machine.is_invite() {
                        (self.config.timer_a_initial, self.config.timer_a_max)
                    } else {
                        (self.config.timer_e_initial, self.config.timer_e_max)
                    };
                    let next = if entry.retransmit_interval.is_zero() {
                        start
                    } else {
                        (entry.retransmit_interval * 2).min(cap)
                    };
                    entry.retransmit_interval = next;
                    entry.retransmit_at = Some(now + next);
                    Act::Retransmit(entry.data.request.clone())
                } else if entry.terminate_at.is_some_and(|at| now >= at) {
                    Act::Terminate
                } else {
                    Act::None
                }
            };
            match act {
                Act::Timeout {
                    server_tx,
                    response,
                } => {
                    self.client_txns.remove(&key);
                    self.send_to_tu(TuEvent::Response {
                        server_tx,
                        client_tx: key,
                        response,
                    })
                    .await;
                }
                Act::TimerC {
                    server_tx,
                    cancel,
                    response,
                } => {
                    self.client_txns.remove(&key);
                    self.send_to_transport(Direction::Upstream, cancel.into())
                        .await;
                    self.send_to_tu(TuEvent::Response {
                        server_tx,
                        client_tx: key,
                        response,
                    })
                    .await;
                }
                Act::Retransmit(request) => {
                    self.send_to_transport(Direction::Upstream, request.into())
                        .await;
                }
                Act::Terminate => {
                    self.client_txns.remove(&key);
                }
                Act::None => {}
            }
        }
    }

    async fn reject_request(&self, request: &Request, status: u16, reason: &str) {
        let mut response = Response::new(
            StatusLine::new(status, reason),
            sip_msg::Headers::new(),
            Bytes::new(),
        );
        copy_headers(
            &mut response.headers,
            &request.headers,
            &["Via", "From", "To", "Call-ID", "CSeq"],
        );
        self.send_to_transport(Direction::Downstream, response.into())
            .await;
    }

    async fn send_to_transport(&self, direction: Direction, mut message: SipMessage) {
        message.ensure_content_length();
        let evt = TransportEvent { direction, message };
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            sent = self.to_transport.send(evt) => {
                if sent.is_err() {
                    debug!("transport queue closed; dropping message");
                }
            }
        }
    }

    async fn send_to_tu(&self, mut event: TuEvent) {
        match &mut event {
            TuEvent::Request { request, .. } => request.ensure_content_length(),
            TuEvent::Response { response, .. } => response.ensure_content_length(),
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            sent = self.to_tu.send(event) => {
                if sent.is_err() {
                    debug!("TU queue closed; dropping event");
                }
            }
        }
    }
}

/// Synthesises the 408 delivered to the TU when timer B, F, or C fires.
fn timeout_response(request: &Request) -> Response {
    let mut response = Response::new(
        StatusLine::new(408, "Request Timeout"),
        sip_msg::Headers::new(),
        Bytes::new(),
    );
    copy_headers(
        &mut response.headers,
        &request.headers,
        &["Via", "From", "To", "Call-ID", "CSeq"],
    );
    response.ensure_content_length();
    response
}

/// Builds the CANCEL sent upstream when timer C expires: same Request-URI and
/// Via (branch included), CSeq number preserved with method CANCEL, no body.
fn cancel_from_request(request: &Request) -> Request {
    let mut cancel = request.clone();
    cancel.start.method = Method::Cancel;
    cancel.body = Bytes::new();
    let number = cseq_number(&request.headers).unwrap_or(1);
    cancel.headers.set("CSeq", format_cseq(number, "CANCEL"));
    cancel.ensure_content_length();
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use sip_msg::{Headers, RequestLine};

    fn new_invite() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client.example.com;branch=z9hG4bKclient1");
        headers.push("Max-Forwards", "70");
        headers.push("From", "<sip:alice@example.com>;tag=a1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "call-1@client.example.com");
        headers.push("CSeq", "314159 INVITE");
        Request::new(
            RequestLine::new(Method::Invite, "sip:bob@example.com"),
            headers,
            Bytes::new(),
        )
    }

    fn new_options() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client.example.com;branch=z9hG4bKopts1");
        headers.push("From", "<sip:alice@example.com>;tag=a2");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "call-2@client.example.com");
        headers.push("CSeq", "7 OPTIONS");
        Request::new(
            RequestLine::new(Method::Options, "sip:bob@example.com"),
            headers,
            Bytes::new(),
        )
    }

    fn response_from(request: &Request, code: u16) -> Response {
        let mut response = Response::with_status(code);
        copy_headers(
            &mut response.headers,
            &request.headers,
            &["Via", "From", "To", "Call-ID", "CSeq"],
        );
        response
    }

    struct Fixture {
        layer: TransactionLayer,
        clock: ManualClock,
        transport_rx: mpsc::Receiver<TransportEvent>,
        tu_rx: mpsc::Receiver<TuEvent>,
    }

    fn fixture() -> Fixture {
        let (transport_tx, transport_rx) = mpsc::channel(64);
        let (tu_tx, tu_rx) = mpsc::channel(64);
        let clock = ManualClock::new();
        let layer = TransactionLayer::new(
            transport_tx,
            tu_tx,
            TimerConfig::default(),
            Arc::new(clock.clone()),
            CancellationToken::new(),
        );
        Fixture {
            layer,
            clock,
            transport_rx,
            tu_rx,
        }
    }

    fn downstream(message: impl Into<SipMessage>) -> TransportEvent {
        TransportEvent {
            direction: Direction::Downstream,
            message: message.into(),
        }
    }

    fn upstream(message: impl Into<SipMessage>) -> TransportEvent {
        TransportEvent {
            direction: Direction::Upstream,
            message: message.into(),
        }
    }

    #[tokio::test]
    async fn missing_branch_is_rejected_with_400() {
        let mut fx = fixture();
        let mut invite = new_invite();
        invite.headers.set("Via", "SIP/2.0/UDP client.example.com");
        fx.layer.handle_transport_event(downstream(invite)).await;

        let evt = fx.transport_rx.try_recv().expect("400 downstream");
        assert_eq!(evt.direction, Direction::Downstream);
        let response = evt.message.as_response().expect("response");
        assert_eq!(response.start.code, 400);
        assert_eq!(fx.layer.server_transaction_count(), 0);
    }

    #[tokio::test]
    async fn retransmitted_request_replays_cached_response() {
        let mut fx = fixture();
        let invite = new_invite();
        fx.layer
            .handle_transport_event(downstream(invite.clone()))
            .await;
        let key = match fx.tu_rx.try_recv().expect("tu request") {
            TuEvent::Request { server_tx, .. } => server_tx,
            other => panic!("unexpected event: {:?}", other),
        };

        fx.layer
            .handle_tu_action(TuAction::SendResponse {
                server_tx: key,
                response: response_from(&invite, 200),
            })
            .await;
        let first = fx.transport_rx.try_recv().expect("200 downstream");
        assert_eq!(first.message.as_response().unwrap().start.code, 200);

        fx.layer.handle_transport_event(downstream(invite)).await;
        let replay = fx.transport_rx.try_recv().expect("cached 200 replayed");
        assert_eq!(replay.message.as_response().unwrap().start.code, 200);
        assert!(fx.tu_rx.try_recv().is_err(), "retransmission reached the TU");
        assert_eq!(fx.layer.server_transaction_count(), 1);
    }

    #[tokio::test]
    async fn invite_failure_retransmits_until_timer_h() {
        let mut fx = fixture();
        let invite = new_invite();
        fx.layer
            .handle_transport_event(downstream(invite.clone()))
            .await;
        let key = match fx.tu_rx.try_recv().unwrap() {
            TuEvent::Request { server_tx, .. } => server_tx,
            other => panic!("unexpected event: {:?}", other),
        };
        fx.layer
            .handle_tu_action(TuAction::SendResponse {
                server_tx: key.clone(),
                response: response_from(&invite, 500),
            })
            .await;
        fx.transport_rx.try_recv().expect("initial 500");

        // First retransmission at G = T1.
        fx.clock.advance(Duration::from_millis(600));
        fx.layer.sweep(fx.clock.now()).await;
        let evt = fx.transport_rx.try_recv().expect("timer G retransmission");
        assert_eq!(evt.message.as_response().unwrap().start.code, 500);

        // Timer H removes the transaction.
        fx.clock.advance(Duration::from_secs(33));
        fx.layer.sweep(fx.clock.now()).await;
        assert_eq!(fx.layer.server_transaction_count(), 0);
    }

    #[tokio::test]
    async fn ack_stops_retransmissions_and_arms_timer_i() {
        let mut fx = fixture();
        let invite = new_invite();
        fx.layer
            .handle_transport_event(downstream(invite.clone()))
            .await;
        let key = match fx.tu_rx.try_recv().unwrap() {
            TuEvent::Request { server_tx, .. } => server_tx,
            other => panic!("unexpected event: {:?}", other),
        };
        fx.layer
            .handle_tu_action(TuAction::SendResponse {
                server_tx: key,
                response: response_from(&invite, 486),
            })
            .await;
        fx.transport_rx.try_recv().expect("486 downstream");

        let mut ack = invite.clone();
        ack.start.method = Method::Ack;
        ack.headers.set("CSeq", "314159 ACK");
        fx.layer.handle_transport_event(downstream(ack)).await;

        // No retransmission after the ACK.
        fx.clock.advance(Duration::from_secs(1));
        fx.layer.sweep(fx.clock.now()).await;
        assert!(fx.transport_rx.try_recv().is_err());

        // Timer I (T4) removes the entry.
        fx.clock.advance(Duration::from_secs(5));
        fx.layer.sweep(fx.clock.now()).await;
        assert_eq!(fx.layer.server_transaction_count(), 0);
    }

    #[tokio::test]
    async fn expired_server_transaction_is_swept() {
        let mut fx = fixture();
        fx.layer
            .handle_transport_event(downstream(new_invite()))
            .await;
        assert_eq!(fx.layer.server_transaction_count(), 1);
        fx.clock.advance(Duration::from_secs(33));
        fx.layer.sweep(fx.clock.now()).await;
        assert_eq!(fx.layer.server_transaction_count(), 0);
    }

    #[tokio::test]
    async fn non_invite_timeout_synthesises_408() {
        let mut fx = fixture();
        let server_tx = TxnKey::new(Method::Options, "z9hG4bKdownstream");
        let options = new_options();
        fx.layer
            .handle_tu_action(TuAction::ForwardRequest {
                server_tx: server_tx.clone(),
                client_tx: Some(TxnKey::new(Method::Options, "z9hG4bKopts1")),
                request: options,
            })
            .await;
        fx.transport_rx.try_recv().expect("request upstream");
        assert_eq!(fx.layer.client_transaction_count(), 1);

        fx.clock.advance(Duration::from_secs(33));
        fx.layer.sweep(fx.clock.now()).await;

        let evt = fx.tu_rx.try_recv().expect("408 to the TU");
        match evt {
            TuEvent::Response {
                server_tx: event_server,
                response,
                ..
            } => {
                assert_eq!(event_server, server_tx);
                assert_eq!(response.start.code, 408);
                assert!(response.headers.get("Via").is_some());
                assert_eq!(
                    response.headers.get("CSeq").unwrap().as_str(),
                    "7 OPTIONS"
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(fx.layer.client_transaction_count(), 0);
    }

    #[tokio::test]
    async fn timer_e_retransmits_with_doubling() {
        let mut fx = fixture();
        fx.layer
            .handle_tu_action(TuAction::ForwardRequest {
                server_tx: TxnKey::new(Method::Options, "z9hG4bKsrv"),
                client_tx: Some(TxnKey::new(Method::Options, "z9hG4bKopts1")),
                request: new_options(),
            })
            .await;
        fx.transport_rx.try_recv().expect("initial send");

        // E fires at T1, then doubles to 1s.
        fx.clock.advance(Duration::from_millis(600));
        fx.layer.sweep(fx.clock.now()).await;
        assert!(fx.transport_rx.try_recv().is_ok(), "first retransmission");

        fx.clock.advance(Duration::from_millis(600));
        fx.layer.sweep(fx.clock.now()).await;
        assert!(
            fx.transport_rx.try_recv().is_err(),
            "doubled interval has not elapsed yet"
        );

        fx.clock.advance(Duration::from_millis(600));
        fx.layer.sweep(fx.clock.now()).await;
        assert!(fx.transport_rx.try_recv().is_ok(), "second retransmission");
    }

    #[tokio::test]
    async fn timer_c_emits_cancel_then_408() {
        let mut fx = fixture();
        let client_tx = TxnKey::new(Method::Invite, "z9hG4bKfork1");
        let mut invite = new_invite();
        invite
            .headers
            .set("Via", "SIP/2.0/UDP proxy.local;branch=z9hG4bKfork1");
        fx.layer
            .handle_tu_action(TuAction::ForwardRequest {
                server_tx: TxnKey::new(Method::Invite, "z9hG4bKclient1"),
                client_tx: Some(client_tx.clone()),
                request: invite.clone(),
            })
            .await;
        fx.transport_rx.try_recv().expect("invite upstream");

        // A provisional clears timer B and leaves timer C armed.
        let mut ringing = response_from(&invite, 180);
        ringing.headers.set("CSeq", "314159 INVITE");
        fx.layer.handle_transport_event(upstream(ringing)).await;
        fx.tu_rx.try_recv().expect("180 to TU");

        fx.clock.advance(Duration::from_secs(181));
        fx.layer.sweep(fx.clock.now()).await;

        let cancel_evt = fx.transport_rx.try_recv().expect("CANCEL upstream");
        assert_eq!(cancel_evt.direction, Direction::Upstream);
        let cancel = cancel_evt.message.as_request().expect("request");
        assert_eq!(cancel.start.method, Method::Cancel);
        assert_eq!(
            cancel.headers.get("CSeq").unwrap().as_str(),
            "314159 CANCEL"
        );
        assert!(cancel.body.is_empty());

        match fx.tu_rx.try_recv().expect("408 to TU") {
            TuEvent::Response { response, .. } => assert_eq!(response.start.code, 408),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(fx.layer.client_transaction_count(), 0);
    }

    #[tokio::test]
    async fn invite_2xx_destroys_client_immediately() {
        let mut fx = fixture();
        let client_tx = TxnKey::new(Method::Invite, "z9hG4bKfork2");
        let mut invite = new_invite();
        invite
            .headers
            .set("Via", "SIP/2.0/UDP proxy.local;branch=z9hG4bKfork2");
        fx.layer
            .handle_tu_action(TuAction::ForwardRequest {
                server_tx: TxnKey::new(Method::Invite, "z9hG4bKclient1"),
                client_tx: Some(client_tx),
                request: invite.clone(),
            })
            .await;
        fx.transport_rx.try_recv().expect("invite upstream");

        fx.layer
            .handle_transport_event(upstream(response_from(&invite, 200)))
            .await;
        assert_eq!(fx.layer.client_transaction_count(), 0);

        // No timer A retransmission after destruction.
        fx.clock.advance(Duration::from_secs(1));
        fx.layer.sweep(fx.clock.now()).await;
        assert!(fx.transport_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invite_failure_waits_for_timer_d() {
        let mut fx = fixture();
        let mut invite = new_invite();
        invite
            .headers
            .set("Via", "SIP/2.0/UDP proxy.local;branch=z9hG4bKfork3");
        fx.layer
            .handle_tu_action(TuAction::ForwardRequest {
                server_tx: TxnKey::new(Method::Invite, "z9hG4bKclient1"),
                client_tx: Some(TxnKey::new(Method::Invite, "z9hG4bKfork3")),
                request: invite.clone(),
            })
            .await;
        fx.transport_rx.try_recv().expect("invite upstream");

        fx.layer
            .handle_transport_event(upstream(response_from(&invite, 486)))
            .await;
        fx.tu_rx.try_recv().expect("486 to TU");
        assert_eq!(fx.layer.client_transaction_count(), 1);

        fx.clock.advance(Duration::from_secs(31));
        fx.layer.sweep(fx.clock.now()).await;
        assert_eq!(fx.layer.client_transaction_count(), 1);

        fx.clock.advance(Duration::from_secs(2));
        fx.layer.sweep(fx.clock.now()).await;
        assert_eq!(fx.layer.client_transaction_count(), 0);
        assert!(fx.tu_rx.try_recv().is_err(), "timer D must not produce a 408");
    }

    #[tokio::test]
    async fn non_invite_final_waits_for_timer_k() {
        let mut fx = fixture();
        let options = new_options();
        fx.layer
            .handle_tu_action(TuAction::ForwardRequest {
                server_tx: TxnKey::new(Method::Options, "z9hG4bKsrv"),
                client_tx: Some(TxnKey::new(Method::Options, "z9hG4bKopts1")),
                request: options.clone(),
            })
            .await;
        fx.transport_rx.try_recv().expect("initial send");

        fx.layer
            .handle_transport_event(upstream(response_from(&options, 200)))
            .await;
        fx.tu_rx.try_recv().expect("200 to TU");
        assert_eq!(fx.layer.client_transaction_count(), 1);

        fx.clock.advance(Duration::from_secs(6));
        fx.layer.sweep(fx.clock.now()).await;
        assert_eq!(fx.layer.client_transaction_count(), 0);
    }
}
