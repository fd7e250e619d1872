use std::sync::Arc;

use anyhow::Result;
use collective_core::{CollectiveConfig, CollectiveIntelligenceService, RoundId};
use tracing::{debug, info};

pub struct FederationModule {
    service: Arc<CollectiveIntelligenceService>,
}

impl FederationModule {
    pub fn new(config: CollectiveConfig) -> Result<Self> {
        config.validate()?;
        let module = Self::from_service(Arc::new(CollectiveIntelligenceService::new(config)));
        info!("federation_module_initialized");
        Ok(module)
    }

    pub fn from_service(service: Arc<CollectiveIntelligenceService>) -> Self { Self { service } }

    pub fn service(&self) -> Arc<CollectiveIntelligenceService> { self.service.clone() }

    /// One sweeper tick: aborts rounds whose deadline has passed.
    pub fn sweep(&self) -> Vec<RoundId> {
        let expired = self.service.expire_overdue_rounds();
        if expired.is_empty() {
            debug!("sweep_no_overdue_rounds");
        } else {
            info!(?expired, "sweep_expired_rounds");
        }
        expired
    }

    pub fn shutdown(&self) -> Result<()> {
        let stats = serde_json::to_string(&self.service.get_statistics())?;
        info!(%stats, "federation_module_shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collective_core::ManualClock;
    use std::time::Duration;

    #[test]
    fn sweep_aborts_overdue_rounds() {
        let clock = Arc::new(ManualClock::new(0));
        let service = Arc::new(CollectiveIntelligenceService::with_clock(CollectiveConfig::default(), clock.clone()));
        let module = FederationModule::from_service(service.clone());
        service.register_node("home-1").unwrap();
        let round = service.start_federated_round_with_timeout(None, Duration::from_secs(10)).unwrap();
        assert!(module.sweep().is_empty());
        clock.advance(Duration::from_secs(11));
        assert_eq!(module.sweep(), vec![round]);
        assert!(module.sweep().is_empty());
        module.shutdown().unwrap();
    }
}
