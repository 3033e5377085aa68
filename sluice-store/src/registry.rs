use futures::StreamExt;
use log::debug;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use sluice_model::Snapshot;

use crate::error::RegistryError;

/// Shared key-value registry with Redis semantics: claim locks, live
/// snapshots, pub/sub channels, limiter counters and sessions.
///
/// All cross-instance coordination goes through here; nothing else is
/// shared between processes.
#[derive(Clone)]
pub struct Registry {
    client: redis::Client,
    con: ConnectionManager,
    ns: String,
}

/// One decoded pub/sub delta: `(resource_name, snapshot)`.
pub type Delta = (String, Snapshot);

/// Stream of deltas from a pattern subscription.
pub type DeltaStream = futures::stream::BoxStream<'static, Delta>;

impl Registry {
    pub async fn connect(url: &str, ns: &str) -> Result<Registry, RegistryError> {
        let client = redis::Client::open(url).map_err(RegistryError::Redis)?;
        let con = ConnectionManager::new(client.clone()).await?;
        Ok(Registry {
            client,
            con,
            ns: ns.to_string(),
        })
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.ns, suffix)
    }

    pub async fn ping(&self) -> Result<(), RegistryError> {
        let mut con = self.con.clone();
        let _: () = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }

    /// Attempt to own one (ingester, bucket) tick cluster-wide.
    /// `SET key value NX EX ttl`; false means another instance owns it.
    pub async fn claim(
        &self,
        ingester_id: &str,
        bucket_epoch: i64,
        owner: &str,
        ttl: u64,
    ) -> Result<bool, RegistryError> {
        let key = self.key(&format!("claim:{ingester_id}:{bucket_epoch}"));
        let mut con = self.con.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl)
            .query_async(&mut con)
            .await?;
        Ok(outcome.is_some())
    }

    /// Write the live value snapshot for a resource.
    pub async fn set_snapshot(
        &self,
        resource: &str,
        snapshot: &Snapshot,
    ) -> Result<(), RegistryError> {
        let key = self.key(&format!("resource:{resource}"));
        let payload = rmp_serde::to_vec(snapshot)?;
        let mut con = self.con.clone();
        con.set::<_, _, ()>(key, payload).await?;
        Ok(())
    }

    pub async fn get_snapshot(&self, resource: &str) -> Result<Option<Snapshot>, RegistryError> {
        let key = self.key(&format!("resource:{resource}"));
        let mut con = self.con.clone();
        let payload: Option<Vec<u8>> = con.get(key).await?;
        match payload {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Batched snapshot read; result order matches `resources`.
    pub async fn get_snapshots(
        &self,
        resources: &[String],
    ) -> Result<Vec<Option<Snapshot>>, RegistryError> {
        if resources.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = resources
            .iter()
            .map(|r| self.key(&format!("resource:{r}")))
            .collect();
        let mut con = self.con.clone();
        let payloads: Vec<Option<Vec<u8>>> =
            redis::cmd("MGET").arg(&keys).query_async(&mut con).await?;
        let mut out = Vec::with_capacity(payloads.len());
        for payload in payloads {
            out.push(match payload {
                Some(bytes) => Some(rmp_serde::from_slice(&bytes)?),
                None => None,
            });
        }
        Ok(out)
    }

    /// Publish a delta on `{ns}:{resource}`.
    pub async fn publish_snapshot(
        &self,
        resource: &str,
        snapshot: &Snapshot,
    ) -> Result<(), RegistryError> {
        let channel = self.key(resource);
        let payload = rmp_serde::to_vec(snapshot)?;
        let mut con = self.con.clone();
        con.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    /// Pattern-subscribe to all deltas in this namespace. Undecodable
    /// messages are dropped with a debug log; the stream itself only ends
    /// when the connection does.
    pub async fn subscribe_deltas(&self) -> Result<DeltaStream, RegistryError> {
        let pattern = self.key("*");
        let prefix = format!("{}:", self.ns);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(&pattern).await?;
        debug!("registry pattern subscription active on {pattern}");
        let stream = pubsub
            .into_on_message()
            .filter_map(move |msg| {
                let prefix = prefix.clone();
                async move {
                    let channel = msg.get_channel_name().to_string();
                    let resource = channel.strip_prefix(&prefix)?.to_string();
                    let payload: Vec<u8> = msg.get_payload().ok()?;
                    match rmp_serde::from_slice::<Snapshot>(&payload) {
                        Ok(snapshot) => Some((resource, snapshot)),
                        Err(e) => {
                            debug!("dropping undecodable delta on {channel}: {e}");
                            None
                        }
                    }
                }
            })
            .boxed();
        Ok(stream)
    }

    /// Read limiter counters in one round trip; missing keys read as zero.
    pub async fn counters(&self, keys: &[String]) -> Result<Vec<u64>, RegistryError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.con.clone();
        let values: Vec<Option<u64>> = redis::cmd("MGET").arg(keys).query_async(&mut con).await?;
        Ok(values.into_iter().map(Option::unwrap_or_default).collect())
    }

    /// Read `(counter, ttl)` pairs for limiter inspection.
    pub async fn counters_with_ttl(
        &self,
        keys: &[String],
    ) -> Result<Vec<(u64, i64)>, RegistryError> {
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key).ttl(key);
        }
        let mut con = self.con.clone();
        let flat: Vec<redis::Value> = pipe.query_async(&mut con).await?;
        let mut out = Vec::with_capacity(keys.len());
        for pair in flat.chunks(2) {
            let count: u64 = redis::from_redis_value(&pair[0]).unwrap_or(0);
            let ttl: i64 = redis::from_redis_value(&pair[1]).unwrap_or(-2);
            out.push((count, ttl));
        }
        Ok(out)
    }

    /// Commit limiter increments: pipelined `INCRBY` + `EXPIRE` per key.
    pub async fn bump_counters(
        &self,
        bumps: &[(String, u64, u64)],
    ) -> Result<(), RegistryError> {
        if bumps.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, increment, ttl) in bumps {
            pipe.cmd("INCRBY").arg(key).arg(*increment).ignore();
            pipe.cmd("EXPIRE").arg(key).arg(*ttl).ignore();
        }
        let mut con = self.con.clone();
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    /// Arbitrary short-lived string values (sessions, auth challenges).
    pub async fn set_str(&self, suffix: &str, value: &str, ttl: u64) -> Result<(), RegistryError> {
        let key = self.key(suffix);
        let mut con = self.con.clone();
        con.set_ex::<_, _, ()>(key, value, ttl).await?;
        Ok(())
    }

    pub async fn get_str(&self, suffix: &str) -> Result<Option<String>, RegistryError> {
        let key = self.key(suffix);
        let mut con = self.con.clone();
        Ok(con.get(key).await?)
    }

    pub async fn del(&self, suffix: &str) -> Result<(), RegistryError> {
        let key = self.key(suffix);
        let mut con = self.con.clone();
        con.del::<_, ()>(key).await?;
        Ok(())
    }

    /// Instance self-registration; the key expires unless re-written.
    pub async fn heartbeat(
        &self,
        instance_uid: &str,
        instance_name: &str,
        ttl: u64,
    ) -> Result<(), RegistryError> {
        self.set_str(&format!("instance:{instance_uid}"), instance_name, ttl)
            .await
    }

    pub async fn list_instances(&self) -> Result<Vec<(String, String)>, RegistryError> {
        let pattern = self.key("instance:*");
        let prefix = self.key("instance:");
        let mut con = self.con.clone();
        let keys: Vec<String> = redis::cmd("KEYS").arg(&pattern).query_async(&mut con).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let name: Option<String> = con.get(&key).await?;
            let uid = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
            out.push((uid, name.unwrap_or_default()));
        }
        Ok(out)
    }
}
