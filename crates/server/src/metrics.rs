use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// Prometheus metrics for the chat front end.
pub struct ChatMetrics {
    pub registry: Registry,
    pub packets_total: IntCounterVec,
    pub packets_rate_limited: IntCounter,
    pub dispatch_errors: IntCounter,
    pub decode_errors: IntCounter,
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    pub dispatch_duration: Histogram,
}

impl ChatMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let packets_total = IntCounterVec::new(
            Opts::new("chatfront_packets_total", "Packets dispatched, by kind"),
            &["kind"],
        )?;
        let packets_rate_limited = IntCounter::new(
            "chatfront_packets_rate_limited",
            "Packets dropped by the per-client rate limit",
        )?;
        let dispatch_errors =
            IntCounter::new("chatfront_dispatch_errors", "Dispatches that returned an error")?;
        let decode_errors =
            IntCounter::new("chatfront_decode_errors", "Inbound frames that failed to parse")?;
        let connections_total =
            IntCounter::new("chatfront_connections_total", "Connections accepted")?;
        let connections_active =
            IntGauge::new("chatfront_connections_active", "Connections currently open")?;
        let dispatch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "chatfront_dispatch_duration_seconds",
                "Time spent dispatching one packet",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(packets_total.clone()))?;
        registry.register(Box::new(packets_rate_limited.clone()))?;
        registry.register(Box::new(dispatch_errors.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(dispatch_duration.clone()))?;

        Ok(Self {
            registry,
            packets_total,
            packets_rate_limited,
            dispatch_errors,
            decode_errors,
            connections_total,
            connections_active,
            dispatch_duration,
        })
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
