mod bodies;
mod eval;
mod scheduler;
mod transform;

use std::sync::Arc;

use log::info;
use miette::IntoDiagnostic;

use sluice_model::{EngineConfig, IngesterConfigs, Instance, User};
use sluice_store::{Registry, connect_backend};

use crate::scheduler::{EngineCtx, Scheduler};

#[tokio::main]
async fn main() -> miette::Result<()> {
    env_logger::init();

    let config = EngineConfig::load().into_diagnostic()?;
    let ingesters = IngesterConfigs::load_from_env()
        .into_diagnostic()?
        .ingesters()
        .into_diagnostic()?;
    info!("loaded {} ingester definitions", ingesters.len());

    let registry = Registry::connect(&config.redis_url, &config.ns)
        .await
        .into_diagnostic()?;
    let tsdb = connect_backend(&config.backend).await.into_diagnostic()?;

    let taken: Vec<String> = registry
        .list_instances()
        .await
        .into_diagnostic()?
        .into_iter()
        .map(|(_, name)| name)
        .collect();
    let config_selector = std::env::var("INGESTER_CONFIGS").unwrap_or_default();
    let instance = Instance::bootstrap(&sluice_model::default_workdir(), &config_selector, &taken);
    info!("instance {} ({}) online", instance.name, instance.uid);

    // The internal user table rides the same update contract as any
    // configured resource.
    tsdb.create_table(&User::users_ingester(), None)
        .await
        .into_diagnostic()?;

    let ctx = Arc::new(EngineCtx {
        registry: registry.clone(),
        tsdb,
        config,
        instance,
    });

    let mut scheduler = Scheduler::new(ctx);
    for ingester in ingesters {
        for dependency in ingester.dependencies() {
            info!(
                "{} reads {} through the cached snapshot (no ordering applied)",
                ingester.name, dependency
            );
        }
        let body = bodies::body_for(&ingester, registry.clone()).into_diagnostic()?;
        scheduler.add_ingester(ingester, body);
    }
    scheduler.start();

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    scheduler.stop().await;
    Ok(())
}
