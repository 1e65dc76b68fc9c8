//! Transaction state machines (RFC 3261 Figures 5-8).
//!
//! The four machines share their surrounding bookkeeping, so they are modeled
//! as tagged variants over the entry data rather than separate types. Timer
//! arming lives in the layer; the machines only track state and report the
//! transitions the layer acts on.

use sip_msg::Method;

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteClientState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteServerState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteClientState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteServerState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server-side machine, INVITE or non-INVITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMachine {
    Invite(InviteServerState),
    NonInvite(NonInviteServerState),
}

impl ServerMachine {
    pub fn for_method(method: &Method) -> Self {
        if method.is_invite() {
            ServerMachine::Invite(InviteServerState::Proceeding)
        } else {
            ServerMachine::NonInvite(NonInviteServerState::Trying)
        }
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, ServerMachine::Invite(_))
    }

    /// Advances the machine for a response the TU asked to send.
    pub fn on_send_response(&mut self, status: u16) {
        match self {
            ServerMachine::Invite(state) => {
                *state = if status < 200 {
                    InviteServerState::Proceeding
                } else if status < 300 {
                    // ACK for a 2xx is end-to-end; the transaction is done.
                    InviteServerState::Terminated
                } else {
                    InviteServerState::Completed
                };
            }
            ServerMachine::NonInvite(state) => {
                *state = if status < 200 {
                    NonInviteServerState::Proceeding
                } else {
                    NonInviteServerState::Completed
                };
            }
        }
    }

    /// Handles an ACK for an INVITE server transaction. Returns `true` when
    /// the Completed -> Confirmed transition fired and timer I should start.
    pub fn on_receive_ack(&mut self) -> bool {
        match self {
            ServerMachine::Invite(state) if *state == InviteServerState::Completed => {
                *state = InviteServerState::Confirmed;
                true
            }
            _ => false,
        }
    }
}

/// Client-side machine, INVITE or non-INVITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMachine {
    Invite(InviteClientState),
    NonInvite(NonInviteClientState),
}

impl ClientMachine {
    pub fn for_method(method: &Method) -> Self {
        if method.is_invite() {
            ClientMachine::Invite(InviteClientState::Calling)
        } else {
            ClientMachine::NonInvite(NonInviteClientState::Trying)
        }
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, ClientMachine::Invite(_))
    }

    /// Advances the machine for a received response. Returns `true` when the
    /// entry must be destroyed immediately (2xx on an INVITE: the ACK is the
    /// TU's business and no wait state applies).
    pub fn on_receive_response(&mut self, status: u16) -> bool {
        match self {
            ClientMachine::Invite(state) => {
                if status < 200 {
                    *state = InviteClientState::Proceeding;
                    false
                } else if status < 300 {
                    *state = InviteClientState::Terminated;
                    true
                } else {
                    *state = InviteClientState::Completed;
                    false
                }
            }
            ClientMachine::NonInvite(state) => {
                if status < 200 {
                    *state = NonInviteClientState::Proceeding;
                } else {
                    *state = NonInviteClientState::Completed;
                }
                false
            }
        }
    }

    /// Marks the machine terminated after a timeout or a wait timer.
    pub fn on_timeout(&mut self) {
        match self {
            ClientMachine::Invite(state) => *state = InviteClientState::Terminated,
            ClientMachine::NonInvite(state) => *state = NonInviteClientState::Terminated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_server_final_transitions() {
        let mut machine = ServerMachine::for_method(&Method::Invite);
        machine.on_send_response(180);
        assert_eq!(machine, ServerMachine::Invite(InviteServerState::Proceeding));
        machine.on_send_response(486);
        assert_eq!(machine, ServerMachine::Invite(InviteServerState::Completed));
        assert!(machine.on_receive_ack());
        assert_eq!(machine, ServerMachine::Invite(InviteServerState::Confirmed));
        assert!(!machine.on_receive_ack());
    }

    #[test]
    fn invite_server_2xx_terminates() {
        let mut machine = ServerMachine::for_method(&Method::Invite);
        machine.on_send_response(200);
        assert_eq!(machine, ServerMachine::Invite(InviteServerState::Terminated));
        assert!(!machine.on_receive_ack());
    }

    #[test]
    fn non_invite_server_completes_on_final() {
        let mut machine = ServerMachine::for_method(&Method::Options);
        machine.on_send_response(100);
        assert_eq!(
            machine,
            ServerMachine::NonInvite(NonInviteServerState::Proceeding)
        );
        machine.on_send_response(200);
        assert_eq!(
            machine,
            ServerMachine::NonInvite(NonInviteServerState::Completed)
        );
    }

    #[test]
    fn invite_client_2xx_requests_immediate_destruction() {
        let mut machine = ClientMachine::for_method(&Method::Invite);
        assert!(!machine.on_receive_response(180));
        assert_eq!(machine, ClientMachine::Invite(InviteClientState::Proceeding));
        assert!(machine.on_receive_response(200));
        assert_eq!(machine, ClientMachine::Invite(InviteClientState::Terminated));
    }

    #[test]
    fn invite_client_failure_waits_in_completed() {
        let mut machine = ClientMachine::for_method(&Method::Invite);
        assert!(!machine.on_receive_response(486));
        assert_eq!(machine, ClientMachine::Invite(InviteClientState::Completed));
        machine.on_timeout();
        assert_eq!(machine, ClientMachine::Invite(InviteClientState::Terminated));
    }

    #[test]
    fn non_invite_client_never_destroys_inline() {
        let mut machine = ClientMachine::for_method(&Method::Options);
        assert!(!machine.on_receive_response(100));
        assert!(!machine.on_receive_response(200));
        assert_eq!(
            machine,
            ClientMachine::NonInvite(NonInviteClientState::Completed)
        );
    }
}
