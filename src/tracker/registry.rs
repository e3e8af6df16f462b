//! Vehicle-id to worker-handle map.
//!
//! Sharded so the dispatcher's per-position lookups and the idle sweep don't
//! contend on one lock. Lock sections are short and never held across await
//! points.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::tracker::worker::WorkerMsg;

const SHARD_COUNT: usize = 16;

struct WorkerHandle {
    tx: mpsc::Sender<WorkerMsg>,
    last_seen: Instant,
}

pub struct WorkerRegistry {
    shards: Vec<RwLock<HashMap<String, WorkerHandle>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, vehicle_id: &str) -> &RwLock<HashMap<String, WorkerHandle>> {
        let mut hasher = DefaultHasher::new();
        vehicle_id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    pub fn lookup(&self, vehicle_id: &str) -> Option<mpsc::Sender<WorkerMsg>> {
        let shard = self.shard(vehicle_id).read().expect("registry lock poisoned");
        shard.get(vehicle_id).map(|h| h.tx.clone())
    }

    pub fn register(&self, vehicle_id: &str, tx: mpsc::Sender<WorkerMsg>) {
        let mut shard = self.shard(vehicle_id).write().expect("registry lock poisoned");
        shard.insert(
            vehicle_id.to_string(),
            WorkerHandle {
                tx,
                last_seen: Instant::now(),
            },
        );
    }

    /// Refreshes a worker's last-seen timestamp after a delivered position.
    pub fn touch(&self, vehicle_id: &str) {
        let mut shard = self.shard(vehicle_id).write().expect("registry lock poisoned");
        if let Some(handle) = shard.get_mut(vehicle_id) {
            handle.last_seen = Instant::now();
        }
    }

    pub fn remove(&self, vehicle_id: &str) -> Option<mpsc::Sender<WorkerMsg>> {
        let mut shard = self.shard(vehicle_id).write().expect("registry lock poisoned");
        shard.remove(vehicle_id).map(|h| h.tx)
    }

    /// Pull-based gauge of currently tracked vehicles.
    pub fn count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().expect("registry lock poisoned").len())
            .sum()
    }

    /// Removes every worker idle longer than `timeout` and returns the
    /// handles so the caller can run the resolve-then-destroy sequence.
    pub fn evict_idle(&self, timeout: Duration) -> Vec<(String, mpsc::Sender<WorkerMsg>)> {
        let mut evicted = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.write().expect("registry lock poisoned");
            let idle: Vec<String> = shard
                .iter()
                .filter(|(_, h)| h.last_seen.elapsed() > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in idle {
                if let Some(handle) = shard.remove(&id) {
                    evicted.push((id, handle.tx));
                }
            }
        }
        evicted
    }

    /// Removes and returns every handle, for shutdown.
    pub fn drain(&self) -> Vec<(String, mpsc::Sender<WorkerMsg>)> {
        let mut all = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.write().expect("registry lock poisoned");
            all.extend(shard.drain().map(|(id, h)| (id, h.tx)));
        }
        all
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
