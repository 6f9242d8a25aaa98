use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

pub(crate) struct FedMetrics {
    pub updates_total: Counter<u64>,
    pub late_updates_total: Counter<u64>,
    pub malformed_total: Counter<u64>,
    pub rounds_completed: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
}

static FED_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("round_coordinator"));

pub(crate) static FED_METRICS: Lazy<FedMetrics> = Lazy::new(|| FedMetrics {
    updates_total: FED_METER.u64_counter("fl_updates_total").with_description("Updates appended to a round").build(),
    late_updates_total: FED_METER.u64_counter("fl_late_updates_total").with_description("Updates rejected because their round had completed").build(),
    malformed_total: FED_METER.u64_counter("fl_malformed_records_total").with_description("Inbound records rejected by validation").build(),
    rounds_completed: FED_METER.u64_counter("fl_rounds_completed_total").with_description("Rounds reaching a terminal outcome").build(),
    aggregation_latency_ms: FED_METER.f64_histogram("fl_aggregation_latency_ms").with_description("Aggregation latency ms").with_unit("ms").build(),
});

pub(crate) fn record_outcome(label: &'static str, trigger: &'static str) {
    FED_METRICS.rounds_completed.add(1, &[KeyValue::new("outcome", label), KeyValue::new("trigger", trigger)]);
}
