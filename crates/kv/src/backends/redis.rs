//! Redis-backed `KvStore`.
//!
//! Commands run over a shared `ConnectionManager` which transparently
//! re-establishes the connection. Pub/sub needs a dedicated connection; a
//! background task owns it, resubscribes after any drop, and emits
//! [`KvEvent::Reconnected`] so cache layers can flush whatever they may have
//! missed while disconnected.

use crate::error::{KvError, KvResult};
use crate::keys;
use crate::traits::{KvEvent, KvStore, WriteOp};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use windrose_core::Configuration;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Production store backed by Redis.
pub struct RedisStore {
    manager: ConnectionManager,
    events: broadcast::Sender<KvEvent>,
}

impl RedisStore {
    /// Connect using the redirector configuration.
    pub async fn connect(config: &Configuration) -> KvResult<Self> {
        Self::with_address(
            &config.redis_address,
            &config.redis_password,
            config.redis_db,
        )
        .await
    }

    /// Connect to a specific address (`host:port`).
    pub async fn with_address(address: &str, password: &str, db: i64) -> KvResult<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
            .ok_or_else(|| KvError::Backend(format!("invalid redis address: {address}")))?;

        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                db,
                username: None,
                password: (!password.is_empty()).then(|| password.to_string()),
                ..Default::default()
            },
        };

        let client = redis::Client::open(info).map_err(KvError::from)?;
        let manager = client.get_connection_manager().await?;

        let (events, _) = broadcast::channel(1024);
        spawn_subscriber(client, events.clone());

        Ok(Self { manager, events })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// Owns the pub/sub connection for the lifetime of the process.
fn spawn_subscriber(client: redis::Client, events: broadcast::Sender<KvEvent>) {
    tokio::spawn(async move {
        let channels = [keys::MIRROR_UPDATE, keys::FILE_UPDATE, keys::MIRROR_FILE_UPDATE];
        let mut first_connect = true;
        loop {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(err) => {
                    tracing::warn!(error = %err, "pub/sub connect failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            if let Err(err) = pubsub.subscribe(&channels).await {
                tracing::warn!(error = %err, "pub/sub subscribe failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }

            if !first_connect {
                // Subscribers missed an unknown number of invalidations.
                let _ = events.send(KvEvent::Reconnected);
            }
            first_connect = false;

            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload = msg.get_payload::<String>().unwrap_or_default();
                let _ = events.send(KvEvent::Message { channel, payload });
            }

            tracing::warn!("pub/sub connection lost, reconnecting");
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });
}

#[async_trait]
impl KvStore for RedisStore {
    async fn string_get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> KvResult<bool> {
        // Compare-and-delete must be atomic or a slow holder could release
        // a lock re-acquired by someone else.
        let script = redis::Script::new(
            r"if redis.call('GET', KEYS[1]) == ARGV[1] then
                  return redis.call('DEL', KEYS[1])
              else
                  return 0
              end",
        );
        let deleted: i64 = script
            .key(key)
            .arg(value)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(deleted > 0)
    }

    async fn hash_get(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.conn().hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> KvResult<()> {
        self.conn().hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        Ok(self.conn().hincr(key, field, delta).await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()> {
        self.conn().sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<()> {
        self.conn().srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn set_random_member(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.conn().srandmember(key).await?)
    }

    async fn set_random_members(&self, key: &str, count: usize) -> KvResult<Vec<String>> {
        Ok(self.conn().srandmember_multiple(key, count).await?)
    }

    async fn set_diff(&self, a: &str, b: &str) -> KvResult<Vec<String>> {
        Ok(self.conn().sdiff(&[a, b]).await?)
    }

    async fn set_inter_store(&self, dst: &str, a: &str, b: &str) -> KvResult<i64> {
        Ok(self.conn().sinterstore(dst, &[a, b]).await?)
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.conn().del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        Ok(self.conn().exists(key).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> KvResult<()> {
        self.conn().rename::<_, _, ()>(from, to).await?;
        Ok(())
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> KvResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                WriteOp::SetAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                WriteOp::SetRemove { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                WriteOp::HashSet { key, fields } => {
                    pipe.hset_multiple(key, fields).ignore();
                }
                WriteOp::Delete { key } => {
                    pipe.del(key).ignore();
                }
                WriteOp::Rename { from, to } => {
                    pipe.cmd("RENAME").arg(from).arg(to).ignore();
                }
                WriteOp::Publish { channel, payload } => {
                    pipe.cmd("PUBLISH").arg(channel).arg(payload).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
        self.conn().publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<KvEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) -> KvResult<()> {
        let reply: String = redis::cmd("PING").query_async(&mut self.conn()).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(KvError::NotReady)
        }
    }
}
