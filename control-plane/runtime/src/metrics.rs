use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct AuthzMetrics {
    decisions: Family<DecisionLabels, Counter>,
    peer_errors: Family<PeerLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct DecisionLabels {
    direction: &'static str,
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PeerLabels {
    peer: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Egress,
    Ingress,
    Token,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Allowed,
    Denied,
    NotFound,
    Error,
}

// === impl AuthzMetrics ===

impl AuthzMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let decisions = Family::<DecisionLabels, Counter>::default();
        reg.register(
            "decisions",
            "Total number of authorization decisions",
            decisions.clone(),
        );

        let peer_errors = Family::<PeerLabels, Counter>::default();
        reg.register(
            "peer_errors",
            "Total number of failed requests to remote peers",
            peer_errors.clone(),
        );

        Self {
            decisions,
            peer_errors,
        }
    }

    pub(crate) fn decision(&self, flow: Flow, outcome: Outcome) {
        let labels = DecisionLabels {
            direction: match flow {
                Flow::Egress => "egress",
                Flow::Ingress => "ingress",
                Flow::Token => "token",
            },
            result: match outcome {
                Outcome::Allowed => "allowed",
                Outcome::Denied => "denied",
                Outcome::NotFound => "not_found",
                Outcome::Error => "error",
            },
        };
        self.decisions.get_or_create(&labels).inc();
    }

    pub(crate) fn peer_error(&self, peer: &str) {
        self.peer_errors
            .get_or_create(&PeerLabels {
                peer: peer.to_string(),
            })
            .inc();
    }
}
