//! Core functionality for the DOTS server.
//!
//! This module contains the mitigation orchestration core: the target and
//! scope models, alias resolution, conflict detection, blocker backends and
//! selection, persistence, lifetime tracking and the engine tying them together.

pub mod alias;
pub mod blocker;
pub mod conflict;
pub mod engine;
pub mod http_blocker;
pub mod lifetime;
pub mod redis_store;
pub mod scope;
pub mod selection;
pub mod store;
pub mod target;

pub use alias::{Alias, AliasStore, InMemoryAliasStore};
pub use blocker::{Blocker, BlockerError, BlockerRegistry, LogBlocker, Protection};
pub use conflict::{check_overlap, OverlapOutcome, ResolvedScope};
pub use engine::{MitigationEngine, MitigationEngineBuilder, MitigationError, PutOutcome};
pub use http_blocker::HttpBlocker;
pub use lifetime::{ActiveMitigationRegistry, LifetimeSweeper, SweeperHandle};
pub use redis_store::{RedisAliasStore, RedisProtectionStore, RedisScopeStore};
pub use scope::{
    AttackStatus, ConflictCause, ConflictInformation, CustomerId, MitigationRequest, MitigationScope,
    MitigationStatus, MitigationStatusSnapshot, ScopeInput, ScopeInstanceId,
};
pub use selection::{LowestLoadSelection, SelectionService, SelectionStrategy};
pub use store::{
    InMemoryProtectionStore, InMemoryScopeStore, MitigationScopeStore, ProtectionStore, StoreError,
};
pub use target::{TargetError, TargetSpec};
