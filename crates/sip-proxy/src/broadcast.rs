// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Broadcast ringing sessions.
//!
//! One session coordinates the parallel client transactions (forks) created
//! for a single downstream INVITE. The first 2xx wins: it is relayed
//! downstream and every other live fork is cancelled. A 2xx arriving after
//! the winner is answered with a BYE. If every fork fails, the highest
//! status seen is relayed as the one downstream final.
//!
//! A fork's CANCEL reuses the fork's own branch: the upstream server matches
//! CANCEL to the INVITE by branch, not by CSeq.

use std::collections::HashMap;

use bytes::Bytes;
use sip_msg::{
    contact_address, copy_headers, cseq_method, cseq_number, format_cseq, Headers, Method, Request,
    Response, StatusLine,
};
use sip_txn::{generate_branch, TuAction, TxnKey};
use smol_str::SmolStr;
use tracing::debug;

use crate::tu::{call_key_from, prepend_via, remove_top_via_with_branch, TransactionUser};

/// One parallel client transaction of a broadcast session.
pub(crate) struct BroadcastFork {
    pub branch: SmolStr,
    pub request_uri: SmolStr,
    /// The transformed INVITE as sent upstream; CANCEL and BYE derive from it.
    pub invite: Request,
    pub is_final: bool,
    pub cancelled: bool,
}

/// Per-server-transaction forking state.
pub(crate) struct BroadcastSession {
    pub original: Request,
    pub call_key: Option<String>,
    pub cseq_number: u32,
    pub forks: HashMap<TxnKey, BroadcastFork>,
    pub fork_order: Vec<TxnKey>,
    pub winner: Option<TxnKey>,
    pub finalised: bool,
    pub canceled: bool,
    pub best_status: Option<u16>,
    pub best_response: Option<Response>,
}

impl BroadcastSession {
    pub fn all_forks_final(&self) -> bool {
        self.forks.values().all(|fork| fork.is_final)
    }
}

impl TransactionUser {
    /// Starts a broadcast session when a rule matches the INVITE's
    /// Request-URI. Returns `false` when no rule applies and the INVITE
    /// should be forwarded normally.
    pub(crate) async fn handle_broadcast_invite(
        &mut self,
        server_tx: &TxnKey,
        req: &Request,
    ) -> bool {
        let Some(policy) = self.broadcast.clone() else {
            return false;
        };
        let targets = policy.targets(req.start.uri.as_str());
        if targets.is_empty() {
            if policy.has(req.start.uri.as_str()) {
                // A rule with no targets rings nobody.
                self.send_action(TuAction::SendResponse {
                    server_tx: server_tx.clone(),
                    response: simple_response(req, 404, "Not Found"),
                })
                .await;
                return true;
            }
            return false;
        }

        let mut session = BroadcastSession {
            original: req.clone(),
            call_key: call_key_from(&req.headers),
            cseq_number: cseq_number(&req.headers).unwrap_or(1),
            forks: HashMap::with_capacity(targets.len()),
            fork_order: Vec::with_capacity(targets.len()),
            winner: None,
            finalised: false,
            canceled: false,
            best_status: None,
            best_response: None,
        };

        let mut actions = Vec::with_capacity(targets.len());
        for target in targets {
            let mut invite = req.clone();
            invite.start.uri = target.clone();
            let branch = generate_branch();
            prepend_via(&mut invite, &branch);
            sip_msg::decrement_max_forwards(&mut invite.headers);
            let client_tx = TxnKey::new(Method::Invite, branch.clone());
            session.forks.insert(
                client_tx.clone(),
                BroadcastFork {
                    branch,
                    request_uri: target,
                    invite: invite.clone(),
                    is_final: false,
                    cancelled: false,
                },
            );
            session.fork_order.push(client_tx.clone());
            actions.push(TuAction::ForwardRequest {
                server_tx: server_tx.clone(),
                client_tx: Some(client_tx),
                request: invite,
            });
        }

        debug!(
            invite = %session.original.start.uri,
            forks = session.fork_order.len(),
            "starting broadcast session"
        );
        if let Some(call_key) = session.call_key.clone() {
            self.call_index.insert(call_key, server_tx.clone());
        }
        self.sessions.insert(server_tx.clone(), session);
        for action in actions {
            self.send_action(action).await;
        }
        true
    }

    /// Routes a downstream CANCEL to the broadcast session it names via the
    /// Call-ID + CSeq-number key. Answers the CANCEL with 200 and cancels
    /// every live fork; the aggregated 487 follows once the forks reply.
    pub(crate) async fn handle_broadcast_cancel(
        &mut self,
        server_tx: &TxnKey,
        req: &Request,
    ) -> bool {
        if self.sessions.is_empty() {
            return false;
        }
        let Some(call_key) = call_key_from(&req.headers) else {
            return false;
        };
        let Some(invite_tx) = self.call_index.get(&call_key).cloned() else {
            return false;
        };

        let mut actions = vec![TuAction::SendResponse {
            server_tx: server_tx.clone(),
            response: simple_response(req, 200, "OK"),
        }];
        {
            let Some(session) = self.sessions.get_mut(&invite_tx) else {
                return false;
            };
            session.canceled = true;
            for key in session.fork_order.clone() {
                if let Some(fork) = session.forks.get_mut(&key) {
                    if let Some(action) = cancel_for_fork(&invite_tx, session.cseq_number, fork) {
                        actions.push(action);
                    }
                }
            }
        }
        for action in actions {
            self.send_action(action).await;
        }
        true
    }

    /// Handles a response belonging to a broadcast session. Returns `false`
    /// when no session owns the server transaction.
    pub(crate) async fn handle_broadcast_response(
        &mut self,
        server_tx: &TxnKey,
        client_tx: &TxnKey,
        response: &Response,
    ) -> bool {
        if !self.sessions.contains_key(server_tx) {
            return false;
        }
        // Finals for the session's own CANCELs and BYEs stay internal.
        let cseq = cseq_method(&response.headers).map(|m| Method::from_token(&m));
        if cseq == Some(Method::Cancel) {
            return true;
        }

        let mut actions = Vec::new();
        let mut cleanup = false;
        {
            let Some(session) = self.sessions.get_mut(server_tx) else {
                return false;
            };
            let fork_branch = match session.forks.get(client_tx) {
                Some(fork) => fork.branch.clone(),
                // Not a fork (e.g. a BYE final): swallow.
                None => return true,
            };

            let mut resp = response.clone();
            remove_top_via_with_branch(&mut resp, fork_branch.as_str());
            let status = resp.start.code;

            if status < 200 {
                if !session.finalised {
                    actions.push(TuAction::SendResponse {
                        server_tx: server_tx.clone(),
                        response: resp,
                    });
                }
            } else {
                if let Some(fork) = session.forks.get_mut(client_tx) {
                    fork.is_final = true;
                }
                if status < 300 {
                    if session.winner.is_none() {
                        session.winner = Some(client_tx.clone());
                        session.finalised = true;
                        actions.push(TuAction::SendResponse {
                            server_tx: server_tx.clone(),
                            response: resp,
                        });
                        for key in session.fork_order.clone() {
                            if key == *client_tx {
                                continue;
                            }
                            if let Some(other) = session.forks.get_mut(&key) {
                                if let Some(action) =
                                    cancel_for_fork(server_tx, session.cseq_number, other)
                                {
                                    actions.push(action);
                                }
                            }
                        }
                    } else if session.winner.as_ref() != Some(client_tx) {
                        if let Some(fork) = session.forks.get(client_tx) {
                            actions.push(bye_for_fork(
                                server_tx,
                                session.cseq_number,
                                fork,
                                &resp,
                            ));
                        }
                    }
                } else {
                    let replaces = session.best_status.is_none_or(|best| status >= best);
                    if replaces {
                        session.best_status = Some(status);
                        session.best_response = Some(resp.clone());
                    }
                    if session.winner.is_none() && session.all_forks_final() {
                        session.finalised = true;
                        let best = session.best_response.clone().unwrap_or(resp);
                        actions.push(TuAction::SendResponse {
                            server_tx: server_tx.clone(),
                            response: best,
                        });
                    }
                }
            }

            if session.finalised && session.all_forks_final() {
                cleanup = true;
            }
        }

        if cleanup {
            if let Some(session) = self.sessions.remove(server_tx) {
                debug!(
                    invite = %session.original.start.uri,
                    canceled = session.canceled,
                    "broadcast session complete"
                );
                if let Some(call_key) = session.call_key {
                    self.call_index.remove(&call_key);
                }
            }
        }
        for action in actions {
            self.send_action(action).await;
        }
        true
    }
}

/// CANCEL for a live fork, reusing the fork's branch so the upstream server
/// matches it to the INVITE. Marks the fork cancelled but not final; its 487
/// still arrives through the transaction layer.
fn cancel_for_fork(
    server_tx: &TxnKey,
    cseq_number: u32,
    fork: &mut BroadcastFork,
) -> Option<TuAction> {
    if fork.is_final || fork.cancelled {
        return None;
    }
    let mut cancel = fork.invite.clone();
    cancel.start.method = Method::Cancel;
    cancel.start.uri = fork.request_uri.clone();
    cancel.body = Bytes::new();
    cancel
        .headers
        .set("CSeq", format_cseq(cseq_number, "CANCEL"));
    cancel.headers.remove("Content-Length");
    fork.cancelled = true;
    Some(TuAction::ForwardRequest {
        server_tx: server_tx.clone(),
        client_tx: Some(TxnKey::new(Method::Cancel, fork.branch.clone())),
        request: cancel,
    })
}

/// BYE for a fork that answered 2xx after another fork already won. The
/// response's Contact, when present, becomes the Request-URI.
fn bye_for_fork(
    server_tx: &TxnKey,
    cseq_number: u32,
    fork: &BroadcastFork,
    response: &Response,
) -> TuAction {
    let mut bye = fork.invite.clone();
    bye.start.method = Method::Bye;
    bye.start.uri = fork.request_uri.clone();
    bye.body = Bytes::new();
    bye.headers
        .set("CSeq", format_cseq(cseq_number.saturating_add(1), "BYE"));
    if let Some(contact) = response.headers.get("Contact") {
        let trimmed = contact.trim();
        if !trimmed.is_empty() {
            let address = contact_address(trimmed);
            bye.start.uri = if address.is_empty() {
                SmolStr::new(trimmed)
            } else {
                SmolStr::new(address)
            };
        }
    }
    bye.headers.remove("Content-Length");
    let branch = generate_branch();
    prepend_via(&mut bye, &branch);
    sip_msg::decrement_max_forwards(&mut bye.headers);
    TuAction::ForwardRequest {
        server_tx: server_tx.clone(),
        client_tx: Some(TxnKey::new(Method::Bye, branch)),
        request: bye,
    }
}

/// A minimal response echoing the request's transaction headers.
fn simple_response(req: &Request, status: u16, reason: &str) -> Response {
    let mut response = Response::new(StatusLine::new(status, reason), Headers::new(), Bytes::new());
    copy_headers(
        &mut response.headers,
        &req.headers,
        &["Via", "From", "To", "Call-ID", "CSeq"],
    );
    response.ensure_content_length();
    response
}
