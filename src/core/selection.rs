//! Blocker selection service.
//!
//! Selection runs on a dispatcher task fed through a bounded work queue.
//! Callers enqueue one job per scope with a result channel and an error
//! channel, then drain exactly one message per job from the pair. The
//! [`SelectionBatch`] helper owns that counting loop.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::core::blocker::{Blocker, BlockerError};
use crate::core::scope::MitigationScope;

/// A scope paired with the blocker chosen for it
pub struct ScopeBlocker {
    pub scope: MitigationScope,
    pub blocker: Arc<dyn Blocker>,
}

/// Policy choosing a blocker for a scope
pub trait SelectionStrategy: Send + Sync {
    fn select(
        &self,
        scope: &MitigationScope,
        pool: &[Arc<dyn Blocker>],
    ) -> Result<Arc<dyn Blocker>, BlockerError>;
}

/// Picks the blocker with the lowest load that still has capacity
#[derive(Debug, Default, Clone, Copy)]
pub struct LowestLoadSelection;

impl SelectionStrategy for LowestLoadSelection {
    fn select(
        &self,
        scope: &MitigationScope,
        pool: &[Arc<dyn Blocker>],
    ) -> Result<Arc<dyn Blocker>, BlockerError> {
        pool.iter()
            .filter(|blocker| blocker.load() < blocker.capacity())
            .min_by_key(|blocker| blocker.load())
            .cloned()
            .ok_or(BlockerError::NoBlockerAvailable(scope.scope_instance_id))
    }
}

struct SelectionJob {
    scope: MitigationScope,
    result_tx: mpsc::UnboundedSender<ScopeBlocker>,
    error_tx: mpsc::UnboundedSender<BlockerError>,
}

/// Asynchronous scope-to-blocker selection
pub struct SelectionService {
    pool: Arc<Vec<Arc<dyn Blocker>>>,
    jobs: mpsc::Sender<SelectionJob>,
}

impl SelectionService {
    /// Spawn the dispatcher task. Must be called from within a tokio runtime.
    pub fn start(
        pool: Vec<Arc<dyn Blocker>>,
        strategy: Arc<dyn SelectionStrategy>,
        queue_size: usize,
    ) -> Self {
        let pool = Arc::new(pool);
        let (jobs, mut queue) = mpsc::channel::<SelectionJob>(queue_size.max(1));

        let dispatch_pool = pool.clone();
        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                let pool = dispatch_pool.clone();
                let strategy = strategy.clone();
                tokio::spawn(async move {
                    match strategy.select(&job.scope, &pool) {
                        Ok(blocker) => {
                            debug!(
                                "Selected blocker {} for mitigation {}",
                                blocker.id(),
                                job.scope.mitigation_id
                            );
                            if job.result_tx.send(ScopeBlocker { scope: job.scope, blocker }).is_err() {
                                warn!("Selection result dropped: receiver gone");
                            }
                        }
                        Err(e) => {
                            if job.error_tx.send(e).is_err() {
                                warn!("Selection error dropped: receiver gone");
                            }
                        }
                    }
                });
            }
            debug!("Selection dispatcher stopped");
        });

        Self { pool, jobs }
    }

    /// Queue one selection; the outcome arrives on exactly one of the channels.
    pub async fn enqueue(
        &self,
        scope: MitigationScope,
        result_tx: mpsc::UnboundedSender<ScopeBlocker>,
        error_tx: mpsc::UnboundedSender<BlockerError>,
    ) -> Result<(), BlockerError> {
        self.jobs
            .send(SelectionJob {
                scope,
                result_tx,
                error_tx,
            })
            .await
            .map_err(|_| BlockerError::SelectionAborted("selection queue closed".to_string()))
    }

    /// Queue a selection for every scope and return the batch to drain.
    pub async fn select_all(&self, scopes: Vec<MitigationScope>) -> Result<SelectionBatch, BlockerError> {
        let (result_tx, results) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        let pending = scopes.len();
        for scope in scopes {
            self.enqueue(scope, result_tx.clone(), error_tx.clone()).await?;
        }
        Ok(SelectionBatch {
            pending,
            results,
            errors,
        })
    }

    /// Live blocker with the given id
    pub fn blocker(&self, id: &str) -> Option<Arc<dyn Blocker>> {
        self.pool.iter().find(|blocker| blocker.id() == id).cloned()
    }

    pub fn pool(&self) -> &[Arc<dyn Blocker>] {
        &self.pool
    }
}

/// Outstanding selections of one request.
///
/// Yields exactly as many messages as scopes were queued, then `None`.
pub struct SelectionBatch {
    pending: usize,
    results: mpsc::UnboundedReceiver<ScopeBlocker>,
    errors: mpsc::UnboundedReceiver<BlockerError>,
}

impl SelectionBatch {
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub async fn next(&mut self) -> Option<Result<ScopeBlocker, BlockerError>> {
        if self.pending == 0 {
            return None;
        }
        self.pending -= 1;
        let message = tokio::select! {
            Some(selected) = self.results.recv() => Ok(selected),
            Some(err) = self.errors.recv() => Err(err),
            else => Err(BlockerError::SelectionAborted(
                "selection channels closed before every scope was answered".to_string(),
            )),
        };
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::blocker::LogBlocker;
    use crate::core::scope::ScopeInput;
    use crate::models::BlockerConfig;
    use chrono::Utc;
    use std::collections::HashMap;

    fn log_blocker(id: &str, capacity: usize) -> Arc<LogBlocker> {
        Arc::new(LogBlocker::new(&BlockerConfig {
            id: id.to_string(),
            kind: "log".to_string(),
            capacity,
            params: HashMap::new(),
        }))
    }

    fn scope(mid: i64) -> MitigationScope {
        let input = ScopeInput {
            mitigation_id: mid,
            target_prefix: vec!["192.0.2.0/24".to_string()],
            lifetime: Some(60),
            ..Default::default()
        };
        MitigationScope::from_input(1, "c", None, &input, Utc::now()).unwrap()
    }

    struct RejectOdd;

    impl SelectionStrategy for RejectOdd {
        fn select(
            &self,
            scope: &MitigationScope,
            pool: &[Arc<dyn Blocker>],
        ) -> Result<Arc<dyn Blocker>, BlockerError> {
            if scope.mitigation_id % 2 == 1 {
                return Err(BlockerError::NoBlockerAvailable(scope.scope_instance_id));
            }
            LowestLoadSelection.select(scope, pool)
        }
    }

    #[tokio::test]
    async fn test_lowest_load_prefers_idle_blocker() {
        let busy = log_blocker("busy", 10);
        let idle = log_blocker("idle", 10);
        busy.register_protection(&scope(1)).await.unwrap();

        let pool: Vec<Arc<dyn Blocker>> = vec![busy.clone() as Arc<dyn Blocker>, idle as Arc<dyn Blocker>];
        let chosen = LowestLoadSelection.select(&scope(2), &pool).unwrap();
        assert_eq!(chosen.id(), "idle");
    }

    #[tokio::test]
    async fn test_full_blockers_are_skipped() {
        let full = log_blocker("full", 1);
        full.register_protection(&scope(1)).await.unwrap();
        let pool: Vec<Arc<dyn Blocker>> = vec![full as Arc<dyn Blocker>];
        assert!(matches!(
            LowestLoadSelection.select(&scope(2), &pool),
            Err(BlockerError::NoBlockerAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_yields_exactly_one_message_per_scope() {
        let pool: Vec<Arc<dyn Blocker>> = vec![log_blocker("log-0", 10) as Arc<dyn Blocker>];
        let service = SelectionService::start(pool, Arc::new(RejectOdd), 2);

        let mut batch = service
            .select_all(vec![scope(1), scope(2), scope(3), scope(4)])
            .await
            .unwrap();
        assert_eq!(batch.pending(), 4);

        let mut selected = Vec::new();
        let mut failed = 0;
        while let Some(message) = batch.next().await {
            match message {
                Ok(pairing) => selected.push(pairing.scope.mitigation_id),
                Err(_) => failed += 1,
            }
        }
        selected.sort_unstable();
        assert_eq!(selected, vec![2, 4]);
        assert_eq!(failed, 2);
        assert!(batch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_blocker_lookup_by_id() {
        let pool: Vec<Arc<dyn Blocker>> = vec![
            log_blocker("a", 1) as Arc<dyn Blocker>,
            log_blocker("b", 1) as Arc<dyn Blocker>,
        ];
        let service = SelectionService::start(pool, Arc::new(LowestLoadSelection), 4);
        assert_eq!(service.blocker("b").map(|b| b.id().to_string()), Some("b".to_string()));
        assert!(service.blocker("zzz").is_none());
        assert_eq!(service.pool().len(), 2);
    }
}
