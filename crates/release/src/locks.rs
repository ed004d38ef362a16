use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Granularity of mutation serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockScope {
    /// One lock per (namespace, release).
    #[default]
    Release,
    /// One lock for every mutation in the process.
    Global,
}

impl FromStr for LockScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "release" => Ok(LockScope::Release),
            "global" => Ok(LockScope::Global),
            other => Err(format!("unknown lock scope '{}', expected release|global", other)),
        }
    }
}

type Shard = Arc<AsyncMutex<()>>;

pub(crate) struct ReleaseLocks {
    scope: LockScope,
    global: Shard,
    shards: Mutex<FxHashMap<(String, String), Shard>>,
}

impl ReleaseLocks {
    pub(crate) fn new(scope: LockScope) -> Self {
        Self { scope, global: Arc::new(AsyncMutex::new(())), shards: Mutex::new(FxHashMap::default()) }
    }

    pub(crate) async fn acquire(&self, namespace: &str, release: &str) -> OwnedMutexGuard<()> {
        let shard = match self.scope {
            LockScope::Global => self.global.clone(),
            LockScope::Release => {
                let mut shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
                // Entries nobody holds or waits on only have the map's reference.
                shards.retain(|_, m| Arc::strong_count(m) > 1);
                shards.entry((namespace.to_string(), release.to_string())).or_default().clone()
            }
        };
        shard.lock_owned().await
    }

    #[cfg(test)]
    fn shard_count(&self) -> usize {
        self.shards.lock().unwrap().len()
    }
}
