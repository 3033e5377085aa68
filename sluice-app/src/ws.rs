use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use globset::{Glob, GlobMatcher};
use hashbrown::{HashMap, HashSet};
use log::{debug, info, warn};
use rocket::State;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock, mpsc};

use sluice_model::{RESERVED_KEYS, Snapshot, User, WsConfig};

use crate::state::AppState;

/// One frame queued for a client; `Close` ends the connection task.
#[derive(Debug, Clone)]
enum Outbound {
    Text(String),
    Close(u16, String),
}

struct ClientInfo {
    user: User,
    connected_at: DateTime<Utc>,
    sender: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct Maps {
    clients_by_topic: HashMap<String, HashSet<u64>>,
    topics_by_client: HashMap<u64, HashSet<String>>,
    info: HashMap<u64, ClientInfo>,
}

struct CachedPayload {
    public: serde_json::Value,
    admin: serde_json::Value,
    at: DateTime<Utc>,
}

/// Subscription router: tracks which client wants which topic, mirrors
/// registry deltas into client sockets, and enforces lifecycle limits.
pub struct Fanout {
    config: WsConfig,
    topic_glob: Option<GlobMatcher>,
    next_id: AtomicU64,
    maps: RwLock<Maps>,
    // Per-topic filtered-payload micro-cache (1 s TTL) so a thousand
    // subscribers don't refilter the same snapshot.
    cache: Mutex<HashMap<String, CachedPayload>>,
}

const CACHE_TTL_MS: i64 = 1_000;

impl Fanout {
    pub fn new(config: WsConfig) -> Fanout {
        let topic_glob = match Glob::new(&config.allowed_topics) {
            Ok(glob) => Some(glob.compile_matcher()),
            Err(e) => {
                warn!("bad ws topic pattern {:?}: {e}", config.allowed_topics);
                None
            }
        };
        Fanout {
            config,
            topic_glob,
            next_id: AtomicU64::new(1),
            maps: RwLock::new(Maps::default()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn register(&self, user: User) -> (u64, mpsc::UnboundedReceiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut maps = self.maps.write().await;
        maps.info.insert(
            id,
            ClientInfo {
                user,
                connected_at: Utc::now(),
                sender: tx,
            },
        );
        (id, rx)
    }

    async fn unregister(&self, id: u64) {
        let mut maps = self.maps.write().await;
        remove_client(&mut maps, id);
    }

    async fn subscribe(&self, id: u64, topics: &[String]) {
        let mut maps = self.maps.write().await;
        for topic in topics {
            maps.clients_by_topic
                .entry(topic.clone())
                .or_default()
                .insert(id);
            maps.topics_by_client.entry(id).or_default().insert(topic.clone());
        }
    }

    async fn unsubscribe(&self, id: u64, topics: &[String]) {
        let mut maps = self.maps.write().await;
        for topic in topics {
            if let Some(clients) = maps.clients_by_topic.get_mut(topic) {
                clients.remove(&id);
                if clients.is_empty() {
                    maps.clients_by_topic.remove(topic);
                }
            }
            if let Some(mine) = maps.topics_by_client.get_mut(&id) {
                mine.remove(topic);
            }
        }
    }

    /// Fan one delta out to every subscriber of its topic, then bulk-drop
    /// clients whose queues are gone.
    pub async fn broadcast(&self, topic: &str, snapshot: &Snapshot) {
        let timestamp = Utc::now().to_rfc3339();
        let mut failed: Vec<u64> = Vec::new();
        {
            let maps = self.maps.read().await;
            let Some(subscribers) = maps.clients_by_topic.get(topic) else {
                return;
            };
            if subscribers.is_empty() {
                return;
            }
            let (public, admin) = self.filtered_payloads(topic, snapshot).await;
            for id in subscribers {
                let Some(info) = maps.info.get(id) else {
                    continue;
                };
                let data = if info.user.is_admin() { &admin } else { &public };
                let frame = serde_json::json!({
                    "type": "data",
                    "topic": topic,
                    "data": data,
                    "timestamp": timestamp,
                })
                .to_string();
                if info.sender.send(Outbound::Text(frame)).is_err() {
                    failed.push(*id);
                }
            }
        }
        if !failed.is_empty() {
            let mut maps = self.maps.write().await;
            for id in failed {
                remove_client(&mut maps, id);
            }
        }
    }

    async fn filtered_payloads(
        &self,
        topic: &str,
        snapshot: &Snapshot,
    ) -> (serde_json::Value, serde_json::Value) {
        let now = Utc::now();
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.get(topic) {
            if (now - entry.at).num_milliseconds() < CACHE_TTL_MS {
                return (entry.public.clone(), entry.admin.clone());
            }
        }
        let admin = filter_snapshot(snapshot, true);
        let public = filter_snapshot(snapshot, false);
        cache.insert(
            topic.to_string(),
            CachedPayload {
                public: public.clone(),
                admin: admin.clone(),
                at: now,
            },
        );
        (public, admin)
    }

    /// Close clients past their maximum lifetime (5-minute cadence).
    pub async fn sweep_lifetimes(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(self.config.client_max_lifetime_s as i64);
        let expired: Vec<u64> = {
            let maps = self.maps.read().await;
            maps.info
                .iter()
                .filter(|(_, info)| info.connected_at < cutoff)
                .map(|(id, _)| *id)
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        info!("disconnecting {} over-lifetime ws clients", expired.len());
        let mut maps = self.maps.write().await;
        for id in expired {
            if let Some(info) = maps.info.get(&id) {
                let _ = info
                    .sender
                    .send(Outbound::Close(1001, "Periodic reconnect required".into()));
            }
            remove_client(&mut maps, id);
        }
    }

    /// Evict beyond-capacity clients oldest-first and prune the payload
    /// cache (10-minute cadence).
    pub async fn sweep_maintenance(&self) {
        {
            let mut maps = self.maps.write().await;
            let over = maps.info.len().saturating_sub(self.config.max_clients);
            if over > 0 {
                let mut by_age: Vec<(u64, DateTime<Utc>)> = maps
                    .info
                    .iter()
                    .map(|(id, info)| (*id, info.connected_at))
                    .collect();
                by_age.sort_by_key(|(_, connected)| *connected);
                for (id, _) in by_age.into_iter().take(over) {
                    if let Some(info) = maps.info.get(&id) {
                        let _ = info
                            .sender
                            .send(Outbound::Close(1001, "Server at capacity".into()));
                    }
                    remove_client(&mut maps, id);
                }
            }
            if !maps.info.is_empty() {
                info!(
                    "ws: {} clients, {} topics",
                    maps.info.len(),
                    maps.clients_by_topic.len()
                );
            }
        }
        let now = Utc::now();
        let mut cache = self.cache.lock().await;
        cache.retain(|_, entry| (now - entry.at).num_milliseconds() < CACHE_TTL_MS * 10);
    }

    /// Split requested topics into allowed and rejected for a principal.
    /// `is_protected` answers for the underlying resource (unknown names
    /// count as protected).
    pub fn authorize_topics(
        &self,
        is_protected: &dyn Fn(&str) -> bool,
        user: &User,
        topics: &[String],
    ) -> (Vec<String>, Vec<String>) {
        let mut allowed = Vec::new();
        let mut rejected = Vec::new();
        for topic in topics {
            let pattern_ok = self
                .topic_glob
                .as_ref()
                .is_none_or(|glob| glob.is_match(topic));
            if !pattern_ok {
                rejected.push(topic.clone());
                continue;
            }
            if !user.is_admin() && is_protected(topic) {
                rejected.push(topic.clone());
                continue;
            }
            allowed.push(topic.clone());
        }
        (allowed, rejected)
    }
}

fn remove_client(maps: &mut Maps, id: u64) {
    maps.info.remove(&id);
    if let Some(topics) = maps.topics_by_client.remove(&id) {
        for topic in topics {
            if let Some(clients) = maps.clients_by_topic.get_mut(&topic) {
                clients.remove(&id);
                if clients.is_empty() {
                    maps.clients_by_topic.remove(&topic);
                }
            }
        }
    }
}

/// Non-admin subscribers never see underscored, `_protected`-suffixed or
/// reserved keys.
pub fn filter_snapshot(snapshot: &Snapshot, admin: bool) -> serde_json::Value {
    let entries = snapshot
        .iter()
        .filter(|(key, _)| {
            admin
                || !(key.starts_with('_')
                    || key.ends_with("_protected")
                    || RESERVED_KEYS.contains(&key.as_str()))
        })
        .map(|(key, value)| (key.clone(), value.to_json()));
    serde_json::Value::Object(entries.collect())
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    action: String,
    #[serde(default)]
    topics: Vec<String>,
}

/// The long-lived subscription endpoint.
#[rocket::get("/ws")]
pub fn endpoint(
    ws: rocket_ws::WebSocket,
    state: &State<Arc<AppState>>,
    req_user: crate::api::AuthedUser,
) -> rocket_ws::Channel<'static> {
    let state = state.inner().clone();
    let user = req_user.0;
    ws.channel(move |mut stream| {
        Box::pin(async move {
            let fanout = state.fanout.clone();
            let (id, mut rx) = fanout.register(user.clone()).await;
            debug!("ws client {id} connected as {}", user.uid);

            loop {
                tokio::select! {
                    queued = rx.recv() => match queued {
                        Some(Outbound::Text(text)) => {
                            if stream.send(rocket_ws::Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close(code, reason)) => {
                            let frame = serde_json::json!({
                                "type": "disconnect",
                                "code": code,
                                "reason": reason,
                            })
                            .to_string();
                            let _ = stream.send(rocket_ws::Message::Text(frame)).await;
                            let _ = stream.close(None).await;
                            break;
                        }
                        None => break,
                    },
                    incoming = stream.next() => {
                        let Some(Ok(message)) = incoming else { break };
                        let rocket_ws::Message::Text(text) = message else { continue };
                        handle_frame(&state, id, &user, &text).await;
                    }
                }
            }

            fanout.unregister(id).await;
            debug!("ws client {id} disconnected");
            Ok(())
        })
    })
}

async fn handle_frame(state: &AppState, id: u64, user: &User, raw: &str) {
    let reply = |text: String| {
        // Replies ride the same queue as broadcasts to keep ordering.
        async move {
            let maps = state.fanout.maps.read().await;
            if let Some(info) = maps.info.get(&id) {
                let _ = info.sender.send(Outbound::Text(text));
            }
        }
    };

    let Ok(frame) = serde_json::from_str::<ClientFrame>(raw) else {
        reply(serde_json::json!({"type": "error", "message": "Invalid JSON"}).to_string()).await;
        return;
    };

    match frame.action.as_str() {
        "ping" => {
            reply(
                serde_json::json!({"type": "pong", "timestamp": Utc::now().to_rfc3339()})
                    .to_string(),
            )
            .await;
        }
        "subscribe" => {
            if frame.topics.is_empty() {
                reply(
                    serde_json::json!({"type": "error", "message": "No topics provided"})
                        .to_string(),
                )
                .await;
                return;
            }
            let (allowed, rejected) =
                state
                    .fanout
                    .authorize_topics(&|topic| state.is_protected(topic), user, &frame.topics);
            if !rejected.is_empty() {
                reply(
                    serde_json::json!({
                        "type": "error",
                        "message": format!("Access denied: {rejected:?}"),
                    })
                    .to_string(),
                )
                .await;
            }
            if allowed.is_empty() {
                return;
            }
            let points = state.config.ws.subscription_base_cost
                + state.config.ws.subscription_per_topic_cost * allowed.len() as u64;
            if state.limiter.consume_points(user, points).await.is_err() {
                reply(
                    serde_json::json!({"type": "error", "message": "Rate limit exceeded"})
                        .to_string(),
                )
                .await;
                return;
            }
            state.fanout.subscribe(id, &allowed).await;
            reply(serde_json::json!({"type": "subscribed", "topics": allowed}).to_string()).await;
        }
        "unsubscribe" => {
            state.fanout.unsubscribe(id, &frame.topics).await;
            reply(
                serde_json::json!({"type": "unsubscribed", "topics": frame.topics}).to_string(),
            )
            .await;
        }
        other => {
            reply(
                serde_json::json!({
                    "type": "error",
                    "message": format!("Unknown action: {other}"),
                })
                .to_string(),
            )
            .await;
        }
    }
}

/// Background task mirroring registry deltas into subscriber sockets.
/// Reconnects with a fixed pause when the pattern subscription drops.
pub async fn run_listener(state: Arc<AppState>) {
    loop {
        match state.registry.subscribe_deltas().await {
            Ok(mut deltas) => {
                info!("ws fan-out subscribed on {}:*", state.registry.ns());
                while let Some((topic, snapshot)) = deltas.next().await {
                    state.fanout.broadcast(&topic, &snapshot).await;
                }
                warn!("ws fan-out subscription ended");
            }
            Err(e) => {
                warn!("ws fan-out subscribe failed: {e}");
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_model::Value;

    #[test]
    fn public_payloads_lose_underscored_protected_and_reserved_keys() {
        let mut snapshot = Snapshot::new();
        snapshot.insert("price".into(), Value::Float(1.0));
        snapshot.insert("_raw".into(), Value::Float(2.0));
        snapshot.insert("source_protected".into(), Value::Float(3.0));
        snapshot.insert("admin".into(), Value::Float(4.0));
        snapshot.insert("internal".into(), Value::Float(5.0));
        snapshot.insert("system".into(), Value::Float(6.0));

        let public = filter_snapshot(&snapshot, false);
        let object = public.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert!(object.contains_key("price"));

        let admin = filter_snapshot(&snapshot, true);
        assert_eq!(admin.as_object().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn broadcast_reaches_only_subscribers_of_the_topic() {
        let fanout = Fanout::new(WsConfig::default());
        let user = User::anonymous_from_ip("203.0.113.9", Default::default());
        let (id_a, mut rx_a) = fanout.register(user.clone()).await;
        let (_id_b, mut rx_b) = fanout.register(user).await;
        fanout.subscribe(id_a, &["BTCUSD".to_string()]).await;

        let mut snapshot = Snapshot::new();
        snapshot.insert("price".into(), Value::Float(40000.0));
        fanout.broadcast("BTCUSD", &snapshot).await;

        let frame = rx_a.try_recv().expect("subscriber should receive");
        let Outbound::Text(text) = frame else {
            panic!("expected text frame")
        };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "data");
        assert_eq!(parsed["topic"], "BTCUSD");
        assert_eq!(parsed["data"]["price"], 40000.0);

        assert!(rx_b.try_recv().is_err(), "non-subscriber must not receive");
    }

    #[tokio::test]
    async fn dead_subscribers_are_cleaned_up_on_broadcast() {
        let fanout = Fanout::new(WsConfig::default());
        let user = User::anonymous_from_ip("203.0.113.9", Default::default());
        let (id, rx) = fanout.register(user).await;
        fanout.subscribe(id, &["BTCUSD".to_string()]).await;
        drop(rx);

        let snapshot = Snapshot::new();
        fanout.broadcast("BTCUSD", &snapshot).await;
        let maps = fanout.maps.read().await;
        assert!(maps.info.is_empty());
        assert!(maps.clients_by_topic.is_empty());
    }

    #[tokio::test]
    async fn lifetime_sweep_notifies_then_drops() {
        let mut config = WsConfig::default();
        config.client_max_lifetime_s = 0;
        let fanout = Fanout::new(config);
        let user = User::anonymous_from_ip("203.0.113.9", Default::default());
        let (_id, mut rx) = fanout.register(user).await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        fanout.sweep_lifetimes().await;

        match rx.recv().await {
            Some(Outbound::Close(code, _)) => assert_eq!(code, 1001),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(fanout.maps.read().await.info.is_empty());
    }

    #[test]
    fn anonymous_subscribers_cannot_reach_protected_topics() {
        let fanout = Fanout::new(WsConfig::default());
        let is_protected = |topic: &str| topic.starts_with("sys.") || topic == "vault";
        let anon = User::anonymous_from_ip("203.0.113.9", Default::default());
        let topics = vec![
            "sys.users".to_string(),
            "vault".to_string(),
            "BTCUSD".to_string(),
        ];

        let (allowed, rejected) = fanout.authorize_topics(&is_protected, &anon, &topics);
        assert_eq!(allowed, vec!["BTCUSD".to_string()]);
        assert_eq!(rejected, vec!["sys.users".to_string(), "vault".to_string()]);

        let mut admin = anon.clone();
        admin.status = sluice_model::UserStatus::Admin;
        let (allowed, rejected) = fanout.authorize_topics(&is_protected, &admin, &topics);
        assert_eq!(allowed.len(), 3);
        assert!(rejected.is_empty());
    }

    #[test]
    fn topic_glob_gates_before_protection() {
        let mut config = WsConfig::default();
        config.allowed_topics = "BTC*".to_string();
        let fanout = Fanout::new(config);
        let anon = User::anonymous_from_ip("203.0.113.9", Default::default());
        let (allowed, rejected) = fanout.authorize_topics(
            &|_| false,
            &anon,
            &["BTCUSD".to_string(), "ETHUSD".to_string()],
        );
        assert_eq!(allowed, vec!["BTCUSD".to_string()]);
        assert_eq!(rejected, vec!["ETHUSD".to_string()]);
    }

    #[tokio::test]
    async fn capacity_sweep_evicts_oldest_first() {
        let mut config = WsConfig::default();
        config.max_clients = 1;
        let fanout = Fanout::new(config);
        let user = User::anonymous_from_ip("203.0.113.9", Default::default());
        let (old_id, mut old_rx) = fanout.register(user.clone()).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let (new_id, _new_rx) = fanout.register(user).await;

        fanout.sweep_maintenance().await;
        let maps = fanout.maps.read().await;
        assert!(!maps.info.contains_key(&old_id));
        assert!(maps.info.contains_key(&new_id));
        drop(maps);
        assert!(matches!(old_rx.recv().await, Some(Outbound::Close(_, _))));
    }
}
