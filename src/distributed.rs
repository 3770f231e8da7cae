//! Optional distributed coordination store.
//!
//! Sketched, not required: single-process correctness never depends on
//! this trait. [`NoopStore`] is the default and satisfies the trait
//! without blocking; [`RedisStore`] is available behind the
//! `distributed-redis` feature for cross-process task/metric
//! visibility, supplementing `moltbot/distributed.py` from the
//! original source, which this distillation dropped entirely.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

const TASK_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const MODEL_USAGE_TTL: Duration = Duration::from_secs(60 * 60);
const AVAILABILITY_TTL: Duration = Duration::from_secs(5 * 60);

/// Coordination primitives a multi-process deployment can share
/// across instances: overflow queues, cross-process task inspection,
/// model usage/availability mirrors, and named locks.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Push a task id onto the priority-keyed overflow list.
    async fn queue_push(&self, priority: &str, task_id: &str) -> Result<()>;
    /// Pop the next overflowed task id for `priority`, if any.
    async fn queue_pop(&self, priority: &str) -> Result<Option<String>>;

    /// Mirror a task's state as a hash with a 24h TTL.
    async fn put_task(&self, task_id: &str, fields: serde_json::Value) -> Result<()>;
    async fn get_task(&self, task_id: &str) -> Result<Option<serde_json::Value>>;

    /// Mirror a model's usage counter with a 1h TTL.
    async fn incr_model_usage(&self, model_name: &str) -> Result<u64>;
    /// Mirror a model's availability flag with a 5m TTL.
    async fn set_model_available(&self, model_name: &str, available: bool) -> Result<()>;

    /// Acquire a named lock, held for `ttl`. Returns `false` if already held.
    async fn try_lock(&self, name: &str, ttl: Duration) -> Result<bool>;
    async fn unlock(&self, name: &str) -> Result<()>;
}

/// The default: a no-op that never blocks single-process correctness.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl DistributedStore for NoopStore {
    async fn queue_push(&self, _priority: &str, _task_id: &str) -> Result<()> {
        Ok(())
    }

    async fn queue_pop(&self, _priority: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn put_task(&self, _task_id: &str, _fields: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn get_task(&self, _task_id: &str) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn incr_model_usage(&self, _model_name: &str) -> Result<u64> {
        Ok(0)
    }

    async fn set_model_available(&self, _model_name: &str, _available: bool) -> Result<()> {
        Ok(())
    }

    async fn try_lock(&self, _name: &str, _ttl: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn unlock(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "distributed-redis")]
pub mod redis_store {
    use super::*;
    use redis::AsyncCommands;

    /// Redis-backed [`DistributedStore`]. Keys are namespaced under
    /// `moltbot:` to coexist with other tenants of the same instance.
    pub struct RedisStore {
        client: redis::Client,
    }

    impl RedisStore {
        pub fn connect(url: &str) -> Result<Self> {
            let client = redis::Client::open(url).map_err(|e| crate::error::Error::Internal(e.into()))?;
            Ok(Self { client })
        }

        async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| crate::error::Error::Internal(e.into()))
        }
    }

    #[async_trait]
    impl DistributedStore for RedisStore {
        async fn queue_push(&self, priority: &str, task_id: &str) -> Result<()> {
            let mut conn = self.conn().await?;
            let _: () = conn
                .rpush(format!("moltbot:queue:{priority}"), task_id)
                .await
                .map_err(|e| crate::error::Error::Internal(e.into()))?;
            Ok(())
        }

        async fn queue_pop(&self, priority: &str) -> Result<Option<String>> {
            let mut conn = self.conn().await?;
            conn.lpop(format!("moltbot:queue:{priority}"), None)
                .await
                .map_err(|e| crate::error::Error::Internal(e.into()))
        }

        async fn put_task(&self, task_id: &str, fields: serde_json::Value) -> Result<()> {
            let mut conn = self.conn().await?;
            let key = format!("moltbot:task:{task_id}");
            let body = fields.to_string();
            let _: () = conn.set_ex(&key, body, TASK_TTL.as_secs()).await.map_err(|e| crate::error::Error::Internal(e.into()))?;
            Ok(())
        }

        async fn get_task(&self, task_id: &str) -> Result<Option<serde_json::Value>> {
            let mut conn = self.conn().await?;
            let raw: Option<String> = conn
                .get(format!("moltbot:task:{task_id}"))
                .await
                .map_err(|e| crate::error::Error::Internal(e.into()))?;
            Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
        }

        async fn incr_model_usage(&self, model_name: &str) -> Result<u64> {
            let mut conn = self.conn().await?;
            let key = format!("moltbot:model_usage:{model_name}");
            let count: u64 = conn.incr(&key, 1).await.map_err(|e| crate::error::Error::Internal(e.into()))?;
            let _: () = conn.expire(&key, MODEL_USAGE_TTL.as_secs() as i64).await.map_err(|e| crate::error::Error::Internal(e.into()))?;
            Ok(count)
        }

        async fn set_model_available(&self, model_name: &str, available: bool) -> Result<()> {
            let mut conn = self.conn().await?;
            let key = format!("moltbot:model_available:{model_name}");
            let _: () = conn
                .set_ex(&key, available.to_string(), AVAILABILITY_TTL.as_secs())
                .await
                .map_err(|e| crate::error::Error::Internal(e.into()))?;
            Ok(())
        }

        async fn try_lock(&self, name: &str, ttl: Duration) -> Result<bool> {
            let mut conn = self.conn().await?;
            let key = format!("moltbot:lock:{name}");
            let acquired: bool = redis::cmd("SET")
                .arg(&key)
                .arg("1")
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|e| crate::error::Error::Internal(e.into()))?;
            Ok(acquired)
        }

        async fn unlock(&self, name: &str) -> Result<()> {
            let mut conn = self.conn().await?;
            let _: () = conn.del(format!("moltbot:lock:{name}")).await.map_err(|e| crate::error::Error::Internal(e.into()))?;
            Ok(())
        }
    }
}

#[cfg(feature = "distributed-redis")]
pub use redis_store::RedisStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_store_never_blocks_and_reports_absence() {
        let store = NoopStore;
        store.queue_push("HIGH", "t1").await.unwrap();
        assert!(store.queue_pop("HIGH").await.unwrap().is_none());
        assert!(store.get_task("t1").await.unwrap().is_none());
        assert!(store.try_lock("x", Duration::from_secs(1)).await.unwrap());
    }
}
