//! Connection flow: the ordered steps an upstream leg walks between
//! `CONNECTING` and `AWAITING_INITIAL`.
//!
//! Each step knows when it applies, which state the connection shows while
//! it runs, and whether its success already satisfies the client's initial
//! request (in which case that request is never forwarded). The driver loop
//! lives in `server.rs`; keeping the step logic here keeps it inspectable
//! and unit-testable without sockets.

use crate::state::ConnectionState;

/// Shape of the connection being established, fixed before the flow starts.
#[derive(Debug, Clone, Copy)]
pub struct FlowPlan {
    /// Dialing a chained proxy rather than the origin.
    pub chained: bool,
    /// The hop to the chained proxy itself is TLS.
    pub chain_tls: bool,
    /// The client's initial request was `CONNECT`.
    pub is_connect: bool,
    /// `CONNECT` will be intercepted rather than blind-tunneled.
    pub mitm: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStep {
    /// Resolve the dial authority to a socket address.
    Resolve,
    /// TCP connect to the resolved address.
    ConnectTransport,
    /// TLS handshake with the chained proxy.
    ChainTls,
    /// `CONNECT <ultimate_authority>` through the chained proxy.
    ChainedConnect,
    /// TLS handshake with the origin (interception re-originates TLS).
    OriginTls,
    /// Strip HTTP codecs for a blind tunnel.
    EstablishTunnel,
}

impl FlowStep {
    /// Flow order. The driver walks this slice, skipping non-applicable
    /// steps.
    pub const ALL: [FlowStep; 6] = [
        FlowStep::Resolve,
        FlowStep::ConnectTransport,
        FlowStep::ChainTls,
        FlowStep::ChainedConnect,
        FlowStep::OriginTls,
        FlowStep::EstablishTunnel,
    ];

    pub fn applies(self, plan: &FlowPlan) -> bool {
        match self {
            FlowStep::Resolve | FlowStep::ConnectTransport => true,
            FlowStep::ChainTls => plan.chained && plan.chain_tls,
            FlowStep::ChainedConnect => plan.chained && plan.is_connect,
            FlowStep::OriginTls => plan.mitm,
            FlowStep::EstablishTunnel => plan.is_connect && !plan.mitm,
        }
    }

    /// Whether success of this step means the buffered initial request must
    /// not be sent upstream.
    pub fn suppresses_initial_request(self) -> bool {
        matches!(self, FlowStep::OriginTls | FlowStep::EstablishTunnel)
    }

    /// State the connection reports while this step is in flight.
    pub fn entering_state(self) -> Option<ConnectionState> {
        match self {
            FlowStep::Resolve | FlowStep::EstablishTunnel => None,
            FlowStep::ConnectTransport => Some(ConnectionState::Connecting),
            FlowStep::ChainTls | FlowStep::OriginTls => Some(ConnectionState::Handshaking),
            FlowStep::ChainedConnect => Some(ConnectionState::NegotiatingConnect),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applicable(plan: &FlowPlan) -> Vec<FlowStep> {
        FlowStep::ALL
            .iter()
            .copied()
            .filter(|s| s.applies(plan))
            .collect()
    }

    #[test]
    fn plain_request_only_dials() {
        let plan = FlowPlan {
            chained: false,
            chain_tls: false,
            is_connect: false,
            mitm: false,
        };
        assert_eq!(
            applicable(&plan),
            vec![FlowStep::Resolve, FlowStep::ConnectTransport]
        );
        assert!(!applicable(&plan)
            .iter()
            .any(|s| s.suppresses_initial_request()));
    }

    #[test]
    fn blind_connect_tunnels_and_suppresses() {
        let plan = FlowPlan {
            chained: false,
            chain_tls: false,
            is_connect: true,
            mitm: false,
        };
        let steps = applicable(&plan);
        assert_eq!(
            steps,
            vec![
                FlowStep::Resolve,
                FlowStep::ConnectTransport,
                FlowStep::EstablishTunnel
            ]
        );
        assert!(steps.iter().any(|s| s.suppresses_initial_request()));
    }

    #[test]
    fn mitm_connect_re_originates_tls() {
        let plan = FlowPlan {
            chained: false,
            chain_tls: false,
            is_connect: true,
            mitm: true,
        };
        assert_eq!(
            applicable(&plan),
            vec![
                FlowStep::Resolve,
                FlowStep::ConnectTransport,
                FlowStep::OriginTls
            ]
        );
    }

    #[test]
    fn chained_connect_negotiates_through_upstream_proxy() {
        let plan = FlowPlan {
            chained: true,
            chain_tls: true,
            is_connect: true,
            mitm: false,
        };
        assert_eq!(
            applicable(&plan),
            vec![
                FlowStep::Resolve,
                FlowStep::ConnectTransport,
                FlowStep::ChainTls,
                FlowStep::ChainedConnect,
                FlowStep::EstablishTunnel
            ]
        );
    }

    #[test]
    fn chained_plain_request_needs_no_connect() {
        let plan = FlowPlan {
            chained: true,
            chain_tls: false,
            is_connect: false,
            mitm: false,
        };
        assert_eq!(
            applicable(&plan),
            vec![FlowStep::Resolve, FlowStep::ConnectTransport]
        );
    }
}
