use shared::metrics_defs::{MetricDef, MetricType};

pub const FORWARD_REQUESTS: MetricDef = MetricDef {
    name: "forward.requests",
    metric_type: MetricType::Counter,
    description: "Calls made to the remote system. Tagged with outcome.",
};

pub const DISPATCH_SENDS: MetricDef = MetricDef {
    name: "dispatch.sends",
    metric_type: MetricType::Counter,
    description: "Per-recipient sends into the backbone. Tagged with outcome.",
};

pub const HTTP_REQUEST_DURATION: MetricDef = MetricDef {
    name: "http.request.duration",
    metric_type: MetricType::Histogram,
    description: "Send endpoint request duration in seconds. Tagged with status.",
};

pub const ALL_METRICS: &[MetricDef] = &[FORWARD_REQUESTS, DISPATCH_SENDS, HTTP_REQUEST_DURATION];
