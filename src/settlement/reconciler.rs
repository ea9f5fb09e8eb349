// Reconciliation pass - resolves operations whose rail outcome was ambiguous.
//
// A submit that timed out (or an async acceptance whose callback never
// arrived) leaves the operation in Submitted with funds still pending. Only
// this pass may move it on, by asking the provider what actually happened;
// the original caller retrying never re-executes the mutation.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::settlement::engine::SettlementEngine;

pub struct Reconciler {
    engine: Arc<SettlementEngine>,
    interval_secs: u64,
}

impl Reconciler {
    pub fn new(engine: Arc<SettlementEngine>, interval_secs: u64) -> Self {
        Self {
            engine,
            interval_secs,
        }
    }

    /// Start the reconciliation loop (runs in background).
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
            // The first tick fires immediately; skip it so a restart storm
            // does not hammer the provider
            ticker.tick().await;

            loop {
                ticker.tick().await;

                match self.engine.reconcile_once().await {
                    Ok(0) => {}
                    Ok(resolved) => {
                        info!("✓ Reconciliation resolved {} operation(s)", resolved)
                    }
                    Err(e) => error!("Reconciliation pass failed: {:?}", e),
                }
            }
        })
    }
}
