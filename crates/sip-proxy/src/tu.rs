// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction user: per-message proxy policy.
//!
//! Requests are REGISTERs (delegated to the registrar), broadcast INVITEs
//! and CANCELs (handed to the session overlay), or plain forwards: prepend a
//! Via, decrement Max-Forwards, hand to the transaction layer. Responses get
//! the proxy's Via stripped and return to their server transaction.

use std::collections::HashMap;
use std::sync::Arc;

use sip_msg::{via_branch, Headers, Method, Request, Response};
use sip_registrar::Registrar;
use sip_txn::{generate_branch, TuAction, TuEvent, TxnKey};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broadcast::BroadcastSession;
use crate::policy::BroadcastPolicy;

/// The sent-by host written into Vias this proxy prepends.
pub const PROXY_VIA_HOST: &str = "proxy.local";

/// Proxy policy layer above the transaction machines.
pub struct TransactionUser {
    pub(crate) actions: mpsc::Sender<TuAction>,
    pub(crate) registrar: Option<Arc<Registrar>>,
    pub(crate) broadcast: Option<Arc<BroadcastPolicy>>,
    pub(crate) sessions: HashMap<TxnKey, BroadcastSession>,
    pub(crate) call_index: HashMap<String, TxnKey>,
    pub(crate) shutdown: CancellationToken,
}

impl TransactionUser {
    pub fn new(
        actions: mpsc::Sender<TuAction>,
        registrar: Option<Arc<Registrar>>,
        broadcast: Option<Arc<BroadcastPolicy>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            actions,
            registrar,
            broadcast,
            sessions: HashMap::new(),
            call_index: HashMap::new(),
            shutdown,
        }
    }

    /// Runs the TU until shutdown or until the event queue closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<TuEvent>) {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => return,
                },
            }
        }
    }

    pub(crate) async fn handle_event(&mut self, event: TuEvent) {
        match event {
            TuEvent::Request { server_tx, request } => {
                self.handle_request(server_tx, request).await
            }
            TuEvent::Response {
                server_tx,
                client_tx,
                response,
            } => self.handle_response(server_tx, client_tx, response).await,
        }
    }

    async fn handle_request(&mut self, server_tx: TxnKey, mut request: Request) {
        if let Some(registrar) = self.registrar.clone() {
            if request.start.method == Method::Register {
                let response = registrar.handle_register(&request).await;
                self.send_action(TuAction::SendResponse {
                    server_tx,
                    response,
                })
                .await;
                return;
            }
        }

        if request.start.method == Method::Cancel && self.handle_broadcast_cancel(&server_tx, &request).await
        {
            return;
        }

        if request.start.method == Method::Invite
            && self.handle_broadcast_invite(&server_tx, &request).await
        {
            return;
        }

        let branch = generate_branch();
        prepend_via(&mut request, &branch);
        sip_msg::decrement_max_forwards(&mut request.headers);
        let client_tx = TxnKey::new(request.start.method.clone(), branch);
        self.send_action(TuAction::ForwardRequest {
            server_tx,
            client_tx: Some(client_tx),
            request,
        })
        .await;
    }

    async fn handle_response(&mut self, server_tx: TxnKey, client_tx: TxnKey, mut response: Response) {
        if self
            .handle_broadcast_response(&server_tx, &client_tx, &response)
            .await
        {
            return;
        }

        remove_top_via_with_branch(&mut response, client_tx.branch.as_str());
        self.send_action(TuAction::SendResponse {
            server_tx,
            response,
        })
        .await;
    }

    pub(crate) async fn send_action(&self, mut action: TuAction) {
        match &mut action {
            TuAction::ForwardRequest { request, .. } => request.ensure_content_length(),
            TuAction::SendResponse { response, .. } => response.ensure_content_length(),
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            sent = self.actions.send(action) => {
                if sent.is_err() {
                    debug!("transaction action queue closed");
                }
            }
        }
    }
}

/// Prepends this proxy's Via with the given branch.
pub(crate) fn prepend_via(request: &mut Request, branch: &str) {
    let via = SmolStr::new(format!("SIP/2.0/UDP {};branch={}", PROXY_VIA_HOST, branch));
    let mut values: Vec<SmolStr> = vec![via];
    values.extend(request.headers.get_all("Via").cloned());
    request.headers.set_all("Via", values);
}

/// Deletes the first Via whose branch equals `branch` (case-insensitive,
/// quotes trimmed). When no Via value remains, the header disappears.
pub(crate) fn remove_top_via_with_branch(response: &mut Response, branch: &str) {
    if branch.is_empty() {
        return;
    }
    let values: Vec<SmolStr> = response.headers.get_all("Via").cloned().collect();
    if values.is_empty() {
        return;
    }
    let mut filtered = Vec::with_capacity(values.len());
    let mut removed = false;
    for value in values {
        if !removed
            && via_branch(value.as_str()).is_some_and(|b| b.eq_ignore_ascii_case(branch))
        {
            removed = true;
            continue;
        }
        filtered.push(value);
    }
    if filtered.is_empty() {
        response.headers.remove("Via");
    } else {
        response.headers.set_all("Via", filtered);
    }
}

/// `lowercase(Call-ID) + "|" + CSeq-number` session key for CANCEL matching.
pub(crate) fn call_key_from(headers: &Headers) -> Option<String> {
    let call_id = headers.get("Call-ID")?.trim().to_ascii_lowercase();
    if call_id.is_empty() {
        return None;
    }
    let cseq = headers.get("CSeq")?;
    let number = cseq.split_whitespace().next()?;
    Some(format!("{}|{}", call_id, number))
}
