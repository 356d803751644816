use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct GatewayMetrics {
    requests: Family<RequestLabels, Counter>,
    duration: Family<HandlerLabels, Histogram>,
    authn: Family<AuthnLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    handler: &'static str,
    code: u16,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct HandlerLabels {
    handler: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct AuthnLabels {
    result: &'static str,
}

/// Outcome labels of the authentication stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthnResult {
    Host,
    Virtual,
    Certificate,
    Anonymous,
    Rejected,
    Error,
}

// === impl GatewayMetrics ===

impl GatewayMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of requests handled by the gateway",
            requests.clone(),
        );

        let duration = Family::<HandlerLabels, Histogram>::new_with_constructor(|| {
            // Exec and watch requests may be held open for a long time.
            Histogram::new([0.01, 0.1, 1.0, 10.0, 300.0])
        });
        reg.register_with_unit(
            "request_duration",
            "Histogram of the time taken to produce response headers",
            Unit::Seconds,
            duration.clone(),
        );

        let authn = Family::<AuthnLabels, Counter>::default();
        reg.register(
            "authn",
            "Total number of requests authenticated, by result",
            authn.clone(),
        );

        Self {
            requests,
            duration,
            authn,
        }
    }

    pub(crate) fn authenticated(&self, result: AuthnResult) {
        self.authn
            .get_or_create(&AuthnLabels {
                result: result.as_str(),
            })
            .inc();
    }

    pub(crate) fn handled(&self, handler: &'static str, code: http::StatusCode, start: time::Instant) {
        self.requests
            .get_or_create(&RequestLabels {
                handler,
                code: code.as_u16(),
            })
            .inc();
        self.duration
            .get_or_create(&HandlerLabels { handler })
            .observe(start.elapsed().as_secs_f64());
    }
}

// === impl AuthnResult ===

impl AuthnResult {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Virtual => "virtual",
            Self::Certificate => "certificate",
            Self::Anonymous => "anonymous",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }
}

impl From<vcluster_gateway_core::Source> for AuthnResult {
    fn from(source: vcluster_gateway_core::Source) -> Self {
        use vcluster_gateway_core::Source;
        match source {
            Source::Host => Self::Host,
            Source::Virtual => Self::Virtual,
            Source::Certificate => Self::Certificate,
            Source::Anonymous => Self::Anonymous,
        }
    }
}
