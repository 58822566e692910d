use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

/// Counters the query client updates when attached with `with_metrics`.
#[derive(Clone)]
pub struct QueryMetrics {
    pub tx_frames: IntCounter,
    pub rx_frames: IntCounter,
    pub queries: IntCounter,
    pub timeouts: IntCounter,
    pub drained_frames: IntCounter,
    pub ignored_registers: IntCounter,
    pub round_trip_seconds: Histogram,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub query: QueryMetrics,
}

impl MetricsHub {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let query = QueryMetrics {
            tx_frames: IntCounter::new("rq_can_tx_frames", "Total request frames sent")?,
            rx_frames: IntCounter::new("rq_can_rx_frames", "Total frames received while awaiting replies")?,
            queries: IntCounter::new("rq_queries_completed", "Queries that completed")?,
            timeouts: IntCounter::new("rq_query_timeouts", "Queries that timed out")?,
            drained_frames: IntCounter::new(
                "rq_drained_frames",
                "Stale frames discarded before a request",
            )?,
            ignored_registers: IntCounter::new(
                "rq_ignored_registers",
                "Reply values for registers that were not requested",
            )?,
            round_trip_seconds: Histogram::with_opts(
                HistogramOpts::new("rq_query_seconds", "Duration of completed queries").buckets(
                    vec![0.0005, 0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.25],
                ),
            )?,
        };
        registry.register(Box::new(query.tx_frames.clone()))?;
        registry.register(Box::new(query.rx_frames.clone()))?;
        registry.register(Box::new(query.queries.clone()))?;
        registry.register(Box::new(query.timeouts.clone()))?;
        registry.register(Box::new(query.drained_frames.clone()))?;
        registry.register(Box::new(query.ignored_registers.clone()))?;
        registry.register(Box::new(query.round_trip_seconds.clone()))?;
        Ok(Self { registry, query })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
