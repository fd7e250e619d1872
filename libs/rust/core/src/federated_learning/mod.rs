//! Federated learning: round lifecycle, aggregation strategies and model history.

pub mod aggregator;
pub mod coordinator;
pub mod round;

pub use aggregator::{combine, quality_score, AggregatedModel, AggregationMethod, ModelAggregator, ModelVersion};
pub use coordinator::{FederatedLearningCoordinator, RoundCounts};
pub use round::{AbortReason, Round, RoundSnapshot, RoundStatus};
