//! Metric groups for rounds, privacy accounting and knowledge exchange.
//!
//! Instruments hang off the global OpenTelemetry meter; without an installed
//! provider they are no-ops, so library users opt in by configuring one.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct RoundMetrics {
    pub started_total: Counter<u64>,
    pub closed_total: Counter<u64>,
    pub aborted_total: Counter<u64>,
    pub updates_total: Counter<u64>,
    pub rejected_updates_total: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
}

pub struct PrivacyMetrics {
    pub charges_total: Counter<u64>,
    pub epsilon_spent_total: Counter<f64>,
    pub budget_rejections_total: Counter<u64>,
    pub excluded_updates_total: Counter<u64>,
}

pub struct KnowledgeMetrics {
    pub extracted_total: Counter<u64>,
    pub filtered_total: Counter<u64>,
    pub transfers_total: Counter<u64>,
    pub rate_limited_total: Counter<u64>,
}

pub struct CollectiveMetrics {
    pub rounds: RoundMetrics,
    pub privacy: PrivacyMetrics,
    pub knowledge: KnowledgeMetrics,
}

static COLLECTIVE_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("collective_core"));

pub static COLLECTIVE_METRICS: Lazy<CollectiveMetrics> = Lazy::new(|| {
    CollectiveMetrics {
        rounds: RoundMetrics {
            started_total: COLLECTIVE_METER.u64_counter("collective_fl_rounds_started_total").with_description("Federated rounds started").build(),
            closed_total: COLLECTIVE_METER.u64_counter("collective_fl_rounds_closed_total").with_description("Federated rounds closed with a model").build(),
            aborted_total: COLLECTIVE_METER.u64_counter("collective_fl_rounds_aborted_total").with_description("Federated rounds aborted (timeout, cancel, failure)").build(),
            updates_total: COLLECTIVE_METER.u64_counter("collective_fl_updates_total").with_description("Model updates accepted into rounds").build(),
            rejected_updates_total: COLLECTIVE_METER.u64_counter("collective_fl_rejected_updates_total").with_description("Model updates rejected at submission").build(),
            aggregation_latency_ms: COLLECTIVE_METER.f64_histogram("collective_fl_aggregation_latency_ms").with_description("Aggregation latency ms").with_unit("ms").build(),
        },
        privacy: PrivacyMetrics {
            charges_total: COLLECTIVE_METER.u64_counter("collective_privacy_charges_total").with_description("Successful privacy budget charges").build(),
            epsilon_spent_total: COLLECTIVE_METER.f64_counter("collective_privacy_epsilon_spent_total").with_description("Total epsilon charged across nodes").build(),
            budget_rejections_total: COLLECTIVE_METER.u64_counter("collective_privacy_budget_rejections_total").with_description("Charges rejected for exceeding the budget").build(),
            excluded_updates_total: COLLECTIVE_METER.u64_counter("collective_privacy_excluded_updates_total").with_description("Updates dropped from aggregation for lack of budget").build(),
        },
        knowledge: KnowledgeMetrics {
            extracted_total: COLLECTIVE_METER.u64_counter("collective_knowledge_extracted_total").with_description("Knowledge items stored").build(),
            filtered_total: COLLECTIVE_METER.u64_counter("collective_knowledge_filtered_total").with_description("Extractions below the confidence gate").build(),
            transfers_total: COLLECTIVE_METER.u64_counter("collective_knowledge_transfers_total").with_description("Knowledge transfers recorded").build(),
            rate_limited_total: COLLECTIVE_METER.u64_counter("collective_knowledge_rate_limited_total").with_description("Transfers rejected by the sliding window quota").build(),
        },
    }
});
