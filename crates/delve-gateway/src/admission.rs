use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{debug, info};

use delve_core::config::AdmissionConfig;
use delve_core::error::{DelveError, Result};
use delve_core::types::RunId;

/// Caller-side quota gate around runs.
///
/// `admit` is asked before a fresh run begins; `settle` is told once a run
/// has completed successfully.
pub trait AdmissionControl: Send + Sync + 'static {
    fn admit(&self, run_id: &RunId) -> BoxFuture<'_, Result<()>>;

    fn settle(&self, run_id: &RunId) -> BoxFuture<'_, ()>;
}

/// Admits every run and keeps no accounts.
pub struct AllowAll;

impl AdmissionControl for AllowAll {
    fn admit(&self, _run_id: &RunId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn settle(&self, _run_id: &RunId) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// In-memory allowance, charged a fixed cost per completed run.
pub struct QuotaLedger {
    remaining: Mutex<u64>,
    cost: u64,
}

impl QuotaLedger {
    pub fn new(allowance: u64, cost: u64) -> Self {
        Self {
            remaining: Mutex::new(allowance),
            cost,
        }
    }

    pub fn remaining(&self) -> u64 {
        *self.remaining.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AdmissionControl for QuotaLedger {
    fn admit(&self, run_id: &RunId) -> BoxFuture<'_, Result<()>> {
        let remaining = self.remaining();
        let result = if remaining < self.cost {
            Err(DelveError::AdmissionDenied {
                run_id: run_id.to_string(),
                remaining,
                cost: self.cost,
            })
        } else {
            debug!(run_id = %run_id, remaining, cost = self.cost, "Run admitted");
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn settle(&self, run_id: &RunId) -> BoxFuture<'_, ()> {
        let left = {
            let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
            *remaining = remaining.saturating_sub(self.cost);
            *remaining
        };
        info!(run_id = %run_id, cost = self.cost, remaining = left, "Run settled");
        Box::pin(async {})
    }
}

/// Admission control the config asks for.
pub fn build_admission(config: &AdmissionConfig) -> Arc<dyn AdmissionControl> {
    if config.enabled {
        Arc::new(QuotaLedger::new(config.allowance, config.run_cost))
    } else {
        Arc::new(AllowAll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        let gate = AllowAll;
        assert!(gate.admit(&RunId::from_string("r")).await.is_ok());
        gate.settle(&RunId::from_string("r")).await;
    }

    #[tokio::test]
    async fn test_ledger_denies_when_exhausted() {
        let ledger = QuotaLedger::new(3, 2);
        let id = RunId::from_string("r1");

        ledger.admit(&id).await.unwrap();
        ledger.settle(&id).await;
        assert_eq!(ledger.remaining(), 1);

        match ledger.admit(&id).await {
            Err(DelveError::AdmissionDenied {
                remaining, cost, ..
            }) => {
                assert_eq!(remaining, 1);
                assert_eq!(cost, 2);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admit_does_not_charge() {
        let ledger = QuotaLedger::new(1, 1);
        let id = RunId::from_string("r1");
        ledger.admit(&id).await.unwrap();
        ledger.admit(&id).await.unwrap();
        assert_eq!(ledger.remaining(), 1);
    }

    #[test]
    fn test_build_admission() {
        let disabled = AdmissionConfig::default();
        assert!(!disabled.enabled);
        let _ = build_admission(&disabled);

        let enabled = AdmissionConfig {
            enabled: true,
            allowance: 5,
            run_cost: 1,
        };
        let _ = build_admission(&enabled);
    }
}
