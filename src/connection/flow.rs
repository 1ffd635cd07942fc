//! Connection flow: the ordered steps between `CONNECTING` and
//! `AWAITING_INITIAL` on a server leg.
//!
//! Steps are a closed enum driven in order by the server task. Exactly one
//! step is in flight at a time; a failure aborts the flow and records the
//! state it failed in, which the client side uses for fallback decisions.

use super::ConnectionState;

/// One suspendable step of the connection flow. Execution lives on
/// [`ServerSide`](super::server::ServerSide); this type carries the ordering,
/// the state each step runs in, and the suppression flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStep {
    /// Resolve the dial authority unless it is already numeric.
    ResolveAddress,
    /// Open the transport connection.
    ConnectTransport,
    /// `CONNECT` through a chained proxy for tunneled requests.
    ChainedConnect,
    /// TLS on the upstream leg (chained-proxy encryption or MITM
    /// re-origination).
    UpstreamTls,
    /// Client-side step: answer the client's `CONNECT`, optionally
    /// terminating TLS with a spoofed certificate.
    RespondConnectEstablished,
    /// Strip the HTTP codecs; both sides go raw.
    StartTunneling,
}

impl FlowStep {
    /// Every step in execution order. Non-applicable steps are skipped by
    /// the driver.
    pub fn ordered() -> [FlowStep; 6] {
        [
            FlowStep::ResolveAddress,
            FlowStep::ConnectTransport,
            FlowStep::ChainedConnect,
            FlowStep::UpstreamTls,
            FlowStep::RespondConnectEstablished,
            FlowStep::StartTunneling,
        ]
    }

    /// The connection state a server leg is in while this step runs.
    pub fn state(&self) -> ConnectionState {
        match self {
            FlowStep::ResolveAddress | FlowStep::ConnectTransport => ConnectionState::Connecting,
            FlowStep::ChainedConnect => ConnectionState::NegotiatingConnect,
            FlowStep::UpstreamTls => ConnectionState::Handshaking,
            FlowStep::RespondConnectEstablished => ConnectionState::NegotiatingConnect,
            FlowStep::StartTunneling => ConnectionState::Tunneling,
        }
    }

    /// When true, a completed flow does not forward the buffered initial
    /// request: the flow itself already satisfied it.
    pub fn suppress_initial_request(&self) -> bool {
        matches!(self, FlowStep::RespondConnectEstablished)
    }
}

/// Outcome bookkeeping for one flow run.
#[derive(Debug, Default)]
pub struct FlowOutcome {
    /// State the flow was in when it failed, reported to the client side.
    pub last_state_before_failure: Option<ConnectionState>,
    /// Set when any executed step suppressed the initial request.
    pub suppress_initial_request: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_order() {
        let steps = FlowStep::ordered();
        assert_eq!(steps[0], FlowStep::ResolveAddress);
        assert_eq!(steps[1], FlowStep::ConnectTransport);
        // CONNECT negotiation with a chained proxy happens before the
        // upstream TLS handshake
        assert!(
            steps.iter().position(|s| *s == FlowStep::ChainedConnect)
                < steps.iter().position(|s| *s == FlowStep::UpstreamTls)
        );
        assert_eq!(steps[5], FlowStep::StartTunneling);
    }

    #[test]
    fn test_step_states() {
        assert_eq!(
            FlowStep::ConnectTransport.state(),
            ConnectionState::Connecting
        );
        assert_eq!(
            FlowStep::ChainedConnect.state(),
            ConnectionState::NegotiatingConnect
        );
        assert_eq!(FlowStep::UpstreamTls.state(), ConnectionState::Handshaking);
    }

    #[test]
    fn test_only_connect_response_suppresses() {
        for step in FlowStep::ordered() {
            assert_eq!(
                step.suppress_initial_request(),
                step == FlowStep::RespondConnectEstablished
            );
        }
    }
}
