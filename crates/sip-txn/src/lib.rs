// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer.
//!
//! The layer owns two registries: server transactions for requests accepted
//! from downstream, and client transactions for requests the proxy sends
//! upstream. All state lives in one task; timers are absolute deadlines on
//! the entries, advanced by a coarse periodic sweep rather than by dedicated
//! timer tasks.

use std::fmt;
use std::time::Duration;

use rand::RngCore;
use sip_msg::{Method, Request, Response, SipMessage};
use smol_str::SmolStr;

pub mod clock;
pub mod fsm;
pub mod layer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fsm::{
    ClientMachine, InviteClientState, InviteServerState, NonInviteClientState,
    NonInviteServerState, ServerMachine,
};
pub use layer::TransactionLayer;

/// Which side of the proxy a transport event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Downstream,
    Upstream,
}

/// A message crossing the transport boundary, tagged with its side.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub direction: Direction,
    pub message: SipMessage,
}

/// Identifies one transaction: uppercased method plus the Via branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxnKey {
    pub method: Method,
    pub branch: SmolStr,
}

impl TxnKey {
    pub fn new(method: Method, branch: impl Into<SmolStr>) -> Self {
        Self {
            method,
            branch: branch.into(),
        }
    }
}

impl fmt::Display for TxnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.method.as_str(), self.branch)
    }
}

/// Notification from the transaction layer to the transaction user.
#[derive(Debug, Clone)]
pub enum TuEvent {
    /// A new request was accepted from downstream.
    Request { server_tx: TxnKey, request: Request },
    /// A response arrived for a client transaction (or was synthesised on
    /// timeout).
    Response {
        server_tx: TxnKey,
        client_tx: TxnKey,
        response: Response,
    },
}

/// Instruction from the transaction user to the transaction layer.
#[derive(Debug, Clone)]
pub enum TuAction {
    /// Create a client transaction and send the request upstream.
    ForwardRequest {
        server_tx: TxnKey,
        client_tx: Option<TxnKey>,
        request: Request,
    },
    /// Send a response on an existing server transaction.
    SendResponse {
        server_tx: TxnKey,
        response: Response,
    },
}

/// Generates a fresh RFC 3261 branch: the magic cookie followed by 16 hex
/// characters of cryptographic randomness.
pub fn generate_branch() -> SmolStr {
    let mut buf = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut buf);
    SmolStr::new(format!("z9hG4bK{}", hex::encode(buf)))
}

/// Timer durations used by the transaction layer. All fields are tunable;
/// `Default` yields the RFC 3261 values derived from T1/T2/T4.
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,

    /// Floor for how long a server transaction is retained for
    /// retransmission caching.
    pub retention: Duration,
    /// Sweep interval for the deadline scan.
    pub cleanup_interval: Duration,

    pub timer_a_initial: Duration,
    pub timer_a_max: Duration,
    pub timer_b: Duration,
    pub timer_c: Duration,
    pub timer_d: Duration,
    pub timer_e_initial: Duration,
    pub timer_e_max: Duration,
    pub timer_f: Duration,
    pub timer_g_initial: Duration,
    pub timer_g_max: Duration,
    pub timer_h: Duration,
    pub timer_i: Duration,
    pub timer_j: Duration,
    pub timer_k: Duration,
}

pub const DEFAULT_T1: Duration = Duration::from_millis(500);
pub const DEFAULT_T2: Duration = Duration::from_secs(4);
pub const DEFAULT_T4: Duration = Duration::from_secs(5);

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1: DEFAULT_T1,
            t2: DEFAULT_T2,
            t4: DEFAULT_T4,
            retention: Duration::from_secs(32),
            cleanup_interval: Duration::from_secs(1),
            timer_a_initial: DEFAULT_T1,
            timer_a_max: DEFAULT_T2,
            timer_b: DEFAULT_T1.saturating_mul(64),
            timer_c: Duration::from_secs(180),
            timer_d: Duration::from_secs(32),
            timer_e_initial: DEFAULT_T1,
            timer_e_max: DEFAULT_T2,
            timer_f: DEFAULT_T1.saturating_mul(64),
            timer_g_initial: DEFAULT_T1,
            timer_g_max: DEFAULT_T2,
            timer_h: DEFAULT_T1.saturating_mul(64),
            timer_i: DEFAULT_T4,
            timer_j: DEFAULT_T1.saturating_mul(64),
            timer_k: DEFAULT_T4,
        }
    }
}

impl TimerConfig {
    /// A configuration scaled down for tests that drive real time.
    pub fn fast(t1: Duration) -> Self {
        let t2 = t1.saturating_mul(8);
        let t4 = t1.saturating_mul(10);
        Self {
            t1,
            t2,
            t4,
            retention: t1.saturating_mul(64),
            cleanup_interval: t1,
            timer_a_initial: t1,
            timer_a_max: t2,
            timer_b: t1.saturating_mul(64),
            timer_c: t1.saturating_mul(360),
            timer_d: t1.saturating_mul(64),
            timer_e_initial: t1,
            timer_e_max: t2,
            timer_f: t1.saturating_mul(64),
            timer_g_initial: t1,
            timer_g_max: t2,
            timer_h: t1.saturating_mul(64),
            timer_i: t4,
            timer_j: t1.saturating_mul(64),
            timer_k: t4,
        }
    }
}
