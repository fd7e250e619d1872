//! Core of the collective intelligence system: federated learning rounds,
//! differential-privacy accounting and cross-node knowledge exchange.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global tracing subscriber once per process.
///
/// `RUST_LOG` wins over `log_level`; `COLLECTIVE_JSON_LOG=1` switches to JSON output.
pub fn init_tracing(service: &str, log_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("COLLECTIVE_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;
        let json_layer = json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
        });
        let text_layer = (!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
        });
        tracing_subscriber::registry().with(env_filter).with(json_layer).with(text_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "collective_core", service, "tracing initialized");
    Ok(())
}

pub mod clock;
pub mod config;
pub mod error;
pub mod federated_learning;
pub mod knowledge;
pub mod metrics;
pub mod privacy;
pub mod registry;
pub mod service;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, load_config_from, BudgetPolicy, CollectiveConfig};
pub use error::{CollectiveError, ErrorKind};
pub use federated_learning::{AbortReason, AggregatedModel, AggregationMethod, FederatedLearningCoordinator, ModelAggregator, ModelVersion, RoundSnapshot, RoundStatus};
pub use knowledge::{KnowledgeItem, KnowledgeQuery, KnowledgeStore, KnowledgeType, TransferRecord};
pub use metrics::{CollectiveMetrics, COLLECTIVE_METRICS};
pub use privacy::{PrivacyBudgetEntry, PrivacyLedger};
pub use registry::{Membership, Participant, ParticipantRegistry, ParticipantStatus};
pub use service::{CollectiveIntelligenceService, ServiceStatistics, ServiceStatus};
pub use types::{ModelUpdate, NodeId, RoundId, WeightMap};
