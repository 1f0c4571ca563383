//! Redis-backed plumbing: the rate/aggregate result queues the worker
//! pushes onto and the integrator drains, the task-node-count cache, and
//! the node-state telemetry buffer (§11).
//!
//! Grounded on the reference implementation's `que.go` (LPush/BRPop FIFO
//! queues feeding the integrator) and `node.go` (the Redis-backed caches
//! alongside the etcd ledger) — the teacher repo has no Redis usage to draw
//! idiom from, so the queue-naming and pipelining shape follows que.go/
//! node.go directly, grounded via the pack's other Redis users noted in
//! DESIGN.md.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};

use crate::errors::QueueError;
use crate::model::Aggregate;

const TASK_NODE_COUNT_TTL_SECS: u64 = 3 * 24 * 3600;
const NODE_STATE_MAX_ENTRIES: isize = 200;
const NODE_STATE_TTL_SECS: u64 = 86_400;

fn rate_queue_key(task_id: i64) -> String {
    format!("gopeck:stress:que:rate:{task_id}")
}

fn aggregate_queue_key(task_id: i64) -> String {
    format!("gopeck:stress:que:aggregate:{task_id}")
}

fn task_node_count_key(task_id: i64) -> String {
    format!("gopeck:stress:task_node_count:{task_id}")
}

fn node_state_key(addr: &str) -> String {
    format!("node_state:{addr}")
}

/// Thin wrapper over a `ConnectionManager`: redis-rs already reconnects
/// and pipelines for us, so this just owns the key layout and
/// serialization convention shared by every caller.
#[derive(Clone)]
pub struct Queue {
    conn: ConnectionManager,
}

impl Queue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Pushes one per-timestamp aggregate bucket onto the per-task rate
    /// queue (§4.3: the integrator's live-rate fiber drains this to
    /// compute windowed latency percentiles).
    pub async fn push_rate_aggregate(
        &self,
        task_id: i64,
        aggregate: &Aggregate,
    ) -> Result<(), QueueError> {
        self.push(&rate_queue_key(task_id), aggregate).await
    }

    /// Pushes one per-interval aggregate bucket onto the per-task
    /// aggregate queue (§4.3: the integrator's aggregation fiber drains
    /// this to build the final per-interval summary).
    pub async fn push_interval_aggregate(
        &self,
        task_id: i64,
        aggregate: &Aggregate,
    ) -> Result<(), QueueError> {
        self.push(&aggregate_queue_key(task_id), aggregate).await
    }

    async fn push<T: Serialize>(&self, key: &str, value: &T) -> Result<(), QueueError> {
        let encoded = serde_json::to_vec(value)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key, encoded)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))
    }

    /// Pops up to `max` entries from the front of a task's rate queue in
    /// one round trip, for the integrator's poll loop.
    pub async fn drain_rate_aggregates(
        &self,
        task_id: i64,
        max: usize,
    ) -> Result<Vec<Aggregate>, QueueError> {
        self.drain(&rate_queue_key(task_id), max).await
    }

    pub async fn drain_interval_aggregates(
        &self,
        task_id: i64,
        max: usize,
    ) -> Result<Vec<Aggregate>, QueueError> {
        self.drain(&aggregate_queue_key(task_id), max).await
    }

    /// Deletes both of a task's queues, called once the integrator finishes
    /// consuming a task's streams (§4.3 live-rate fiber: "Finally clears
    /// the rate queue").
    pub async fn clear_task_queues(&self, task_id: i64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(rate_queue_key(task_id))
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        conn.del::<_, ()>(aggregate_queue_key(task_id))
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))
    }

    async fn drain<T: DeserializeOwned>(
        &self,
        key: &str,
        max: usize,
    ) -> Result<Vec<T>, QueueError> {
        let mut conn = self.conn.clone();
        let mut out = Vec::new();
        for _ in 0..max {
            let raw: Option<Vec<u8>> = conn
                .rpop(key, None)
                .await
                .map_err(|e| QueueError::Transport(e.to_string()))?;
            match raw {
                Some(bytes) => out.push(serde_json::from_slice(&bytes)?),
                None => break,
            }
        }
        Ok(out)
    }

    /// Caches the placed worker count for a task for 3 days (§11), so a
    /// repeated `Integrate` lookup for the same task doesn't have to
    /// recompute it from the assignment history.
    pub async fn cache_task_node_count(
        &self,
        task_id: i64,
        node_count: u32,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(task_node_count_key(task_id), node_count, TASK_NODE_COUNT_TTL_SECS)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))
    }

    pub async fn get_task_node_count(&self, task_id: i64) -> Result<Option<u32>, QueueError> {
        let mut conn = self.conn.clone();
        conn.get(task_node_count_key(task_id))
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))
    }

    /// Buffers a worker's self-reported state (§11 node-state telemetry) as
    /// the newest entry of a capped, TTL'd list — LPUSH + LTRIM to 200 +
    /// EXPIRE 86400s (§5, §6) — for the controller's placement reads to
    /// consult as a freshness signal independent of the registry's liveness
    /// lease.
    pub async fn report_node_state(
        &self,
        addr: &str,
        state: &HashMap<String, String>,
    ) -> Result<(), QueueError> {
        let encoded = serde_json::to_vec(state)?;
        let key = node_state_key(addr);
        let mut conn = self.conn.clone();
        redis::pipe()
            .lpush(&key, encoded)
            .ltrim(&key, 0, NODE_STATE_MAX_ENTRIES - 1)
            .expire(&key, NODE_STATE_TTL_SECS as i64)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))
    }

    /// Batched read of each address's newest node-state entry, one round
    /// trip via a pipeline rather than N sequential `LINDEX`s.
    pub async fn batch_get_node_state(
        &self,
        addrs: &[String],
    ) -> Result<HashMap<String, HashMap<String, String>>, QueueError> {
        if addrs.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for addr in addrs {
            pipe.lindex(node_state_key(addr), 0);
        }
        let raw: Vec<Option<Vec<u8>>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        let mut out = HashMap::new();
        for (addr, entry) in addrs.iter().zip(raw) {
            if let Some(bytes) = entry {
                if let Ok(state) = serde_json::from_slice(&bytes) {
                    out.insert(addr.clone(), state);
                }
            }
        }
        Ok(out)
    }
}

pub fn task_node_count_ttl() -> Duration {
    Duration::from_secs(TASK_NODE_COUNT_TTL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_the_wire_contract() {
        assert_eq!(rate_queue_key(42), "gopeck:stress:que:rate:42");
        assert_eq!(aggregate_queue_key(42), "gopeck:stress:que:aggregate:42");
        assert_eq!(task_node_count_key(7), "gopeck:stress:task_node_count:7");
        assert_eq!(node_state_key("10.0.0.1:7100"), "node_state:10.0.0.1:7100");
    }

    #[test]
    fn task_node_count_ttl_is_three_days() {
        assert_eq!(task_node_count_ttl(), Duration::from_secs(3 * 24 * 3600));
    }
}
