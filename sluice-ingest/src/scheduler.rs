use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{debug, error, info, warn};
use miette::Diagnostic;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sluice_model::{EngineConfig, Ingester, Instance, ResourceKind, Snapshot, Value};
use sluice_store::{Registry, Tsdb};

use crate::bodies::{BodyError, IngesterBody};
use crate::transform::{SnapshotSource, TransformDeps, transform_all};

#[derive(Debug, Error, Diagnostic)]
pub enum TickError {
    #[error("registry error during tick")]
    Registry(#[from] sluice_store::RegistryError),

    #[error("ingester body failed")]
    Body(#[from] BodyError),

    #[error("storage write failed")]
    Store(#[from] sluice_store::StoreError),

    #[error("tick exceeded its deadline")]
    Deadline,
}

/// Process-level context threaded through every tick: the only pieces of
/// state shared across ingesters.
pub struct EngineCtx {
    pub registry: Registry,
    pub tsdb: Arc<dyn Tsdb>,
    pub config: EngineConfig,
    pub instance: Instance,
}

struct Entry {
    ingester: Ingester,
    body: Arc<dyn IngesterBody>,
}

/// Owns the wall-clock calendar of all ingesters. Each ingester gets one
/// task that sleeps to the next cron boundary, races the cluster for the
/// bucket's claim lock, and runs the tick pipeline under a deadline.
pub struct Scheduler {
    ctx: Arc<EngineCtx>,
    entries: Vec<Entry>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<EngineCtx>) -> Scheduler {
        Scheduler {
            ctx,
            entries: Vec::new(),
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn add_ingester(&mut self, ingester: Ingester, body: Box<dyn IngesterBody>) {
        self.entries.push(Entry {
            ingester,
            body: Arc::from(body),
        });
    }

    pub fn start(&mut self) {
        info!(
            "scheduler starting {} ingesters as instance {} ({})",
            self.entries.len(),
            self.ctx.instance.name,
            self.ctx.instance.uid
        );
        for entry in self.entries.drain(..) {
            let ctx = self.ctx.clone();
            let cancel = self.cancel.clone();
            self.handles
                .push(tokio::spawn(run_schedule(ctx, entry.ingester, entry.body, cancel)));
        }

        // Heartbeat keeps this instance visible in the registry.
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move {
            let ttl = ctx.config.heartbeat_ttl;
            let period = Duration::from_secs((ttl / 3).max(1));
            loop {
                if let Err(e) = ctx
                    .registry
                    .heartbeat(&ctx.instance.uid, &ctx.instance.name, ttl)
                    .await
                {
                    warn!("instance heartbeat failed: {e}");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        }));
    }

    pub async fn stop(self) {
        info!("scheduler stopping");
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_schedule(
    ctx: Arc<EngineCtx>,
    mut ing: Ingester,
    body: Arc<dyn IngesterBody>,
    cancel: CancellationToken,
) {
    let expr = ing.interval.cron();
    let schedule = match Schedule::from_str(&expr) {
        Ok(s) => s,
        Err(e) => {
            // Interval tokens map to a closed cron set, so this is a bug,
            // not a config problem.
            error!("{}: invalid cron {expr:?}: {e}", ing.name);
            return;
        }
    };
    debug!("{} scheduled on {expr} ({})", ing.name, ing.interval);

    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        let bucket = ing.interval.bucket_start(next);
        if let Err(e) = run_tick(&ctx, &mut ing, body.as_ref(), bucket).await {
            // The claim, if held, stays consumed; the next bucket retries
            // cleanly.
            error!("{} tick at {bucket} failed: {e}", ing.name);
        }
    }
    debug!("{} schedule loop exited", ing.name);
}

/// Deadline for one tick body: just under the interval, capped by config.
pub fn tick_deadline(interval_secs: u64, config: &EngineConfig) -> Duration {
    let margin = Duration::from_millis(config.tick_deadline_margin_ms);
    let interval = Duration::from_secs(interval_secs);
    let bounded = interval.saturating_sub(margin);
    let cap = Duration::from_secs(config.max_tick_duration);
    if bounded.is_zero() {
        cap.min(interval)
    } else {
        bounded.min(cap)
    }
}

async fn run_tick(
    ctx: &EngineCtx,
    ing: &mut Ingester,
    body: &dyn IngesterBody,
    bucket: DateTime<Utc>,
) -> Result<(), TickError> {
    let claimed = ctx
        .registry
        .claim(
            &ing.id(),
            bucket.timestamp(),
            &ctx.instance.uid,
            ing.interval.claim_ttl(),
        )
        .await?;
    if !claimed {
        // Another instance owns this bucket.
        debug!("{} bucket {bucket} claimed elsewhere, skipping", ing.name);
        return Ok(());
    }

    let deadline = tick_deadline(ing.interval.seconds(), &ctx.config);
    let outcome = tokio::time::timeout(
        deadline,
        execute_tick(
            ing,
            body,
            bucket,
            &ctx.registry,
            ctx.tsdb.clone(),
        ),
    )
    .await;

    let snapshot = match outcome {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(TickError::Deadline),
    };

    // Publish failures leave the tick locally successful; subscribers
    // just miss this delta.
    if let Err(e) = ctx.registry.set_snapshot(&ing.name, &snapshot).await {
        warn!("{}: snapshot cache write failed: {e}", ing.name);
        return Ok(());
    }
    if let Err(e) = ctx.registry.publish_snapshot(&ing.name, &snapshot).await {
        warn!("{}: delta publish failed: {e}", ing.name);
    }
    Ok(())
}

/// The body -> transform -> persist pipeline, separated from claim and
/// publish so it can run against any snapshot source and adapter.
pub async fn execute_tick(
    ing: &mut Ingester,
    body: &dyn IngesterBody,
    bucket: DateTime<Utc>,
    snapshots: &dyn SnapshotSource,
    tsdb: Arc<dyn Tsdb>,
) -> Result<Snapshot, TickError> {
    body.run(ing).await?;

    ing.last_ingested = Some(bucket);
    if ing.resource_kind == ResourceKind::Timeseries {
        ing.set_value("ts", Value::Timestamp(bucket));
    }

    let deps = TransformDeps {
        snapshots,
        tsdb: Some(tsdb.clone()),
        now: bucket,
    };
    transform_all(ing, &deps).await;

    match ing.resource_kind {
        ResourceKind::Update => tsdb.upsert(ing, None).await?,
        _ => tsdb.insert(ing, None).await?,
    }

    Ok(ing.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use hashbrown::HashMap;
    use sluice_model::{Field, FieldType, IngesterKind};
    use sluice_store::SqliteTsdb;

    struct StaticBody(f64);

    #[async_trait]
    impl IngesterBody for StaticBody {
        async fn run(&self, ing: &mut Ingester) -> Result<(), BodyError> {
            ing.set_value("price", Value::Float(self.0));
            Ok(())
        }
    }

    fn btcusd() -> Ingester {
        let mut price = Field::new("price", FieldType::Float64);
        price.transformers = vec!["{self} * 1.0".into()];
        Ingester {
            name: "BTCUSD".into(),
            resource_kind: ResourceKind::Timeseries,
            ingester_kind: IngesterKind::HttpApi,
            interval: "m5".parse().unwrap(),
            fields: vec![price],
            target: String::new(),
            selector: String::new(),
            params: serde_json::Value::Null,
            transformers: Vec::new(),
            tags: Vec::new(),
            protected: false,
            last_ingested: None,
        }
        .finalize(IngesterKind::HttpApi)
        .unwrap()
    }

    #[test]
    fn every_interval_token_yields_a_parseable_cron() {
        for token in [
            "s1", "s5", "s30", "m1", "m5", "m30", "h1", "h12", "D1", "D3", "W1", "M1", "Y1",
        ] {
            let interval: sluice_model::Interval = token.parse().unwrap();
            let expr = interval.cron();
            Schedule::from_str(&expr).unwrap_or_else(|e| panic!("{token} -> {expr}: {e}"));
        }
    }

    #[test]
    fn deadlines_stay_under_the_interval_and_the_cap() {
        let config = EngineConfig::default();
        let short = tick_deadline(5, &config);
        assert!(short < Duration::from_secs(5));
        let long = tick_deadline(86_400, &config);
        assert_eq!(long, Duration::from_secs(config.max_tick_duration));
        assert_eq!(tick_deadline(1, &config), Duration::from_millis(750));
    }

    #[tokio::test]
    async fn tick_pipeline_persists_row_and_builds_snapshot() {
        // Scenario: body emits 40000 at 12:00 for an m5 ingester; the
        // stored row and the snapshot both carry the bucket-aligned
        // timestamp and the transformed price.
        let tsdb = Arc::new(SqliteTsdb::connect(":memory:").await.unwrap());
        let snapshots: HashMap<String, Snapshot> = HashMap::new();
        let mut ing = btcusd();
        let bucket = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let snapshot = execute_tick(
            &mut ing,
            &StaticBody(40_000.0),
            bucket,
            &snapshots,
            tsdb.clone(),
        )
        .await
        .unwrap();

        assert_eq!(snapshot.get("price"), Some(&Value::Float(40_000.0)));
        assert_eq!(snapshot.get("date"), Some(&Value::Timestamp(bucket)));
        assert_eq!(ing.last_ingested, Some(bucket));

        let table = tsdb
            .fetch(
                "BTCUSD",
                bucket - chrono::Duration::minutes(5),
                bucket + chrono::Duration::minutes(5),
                "m5".parse().unwrap(),
                &[],
                false,
            )
            .await
            .unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0][0], Value::Timestamp(bucket));
        assert_eq!(table.rows[0][1], Value::Float(40_000.0));
    }

    #[tokio::test]
    async fn update_resources_upsert_by_uid() {
        struct UserBody;
        #[async_trait]
        impl IngesterBody for UserBody {
            async fn run(&self, ing: &mut Ingester) -> Result<(), BodyError> {
                ing.set_value("uid", Value::String("u1".into()));
                ing.set_value("alias", Value::String("neo".into()));
                Ok(())
            }
        }

        let tsdb = Arc::new(SqliteTsdb::connect(":memory:").await.unwrap());
        let snapshots: HashMap<String, Snapshot> = HashMap::new();
        let mut ing = Ingester {
            name: "accounts".into(),
            resource_kind: ResourceKind::Update,
            ingester_kind: IngesterKind::Processor,
            interval: "h1".parse().unwrap(),
            fields: vec![Field::new("alias", FieldType::String)],
            target: String::new(),
            selector: String::new(),
            params: serde_json::Value::Null,
            transformers: Vec::new(),
            tags: Vec::new(),
            protected: false,
            last_ingested: None,
        }
        .finalize(IngesterKind::Processor)
        .unwrap();

        let bucket = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        for _ in 0..2 {
            execute_tick(&mut ing, &UserBody, bucket, &snapshots, tsdb.clone())
                .await
                .unwrap();
        }
        let rows = tsdb
            .fetch_batch_by_ids("accounts", &["u1".to_string()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["alias"], Value::String("neo".into()));
    }
}
