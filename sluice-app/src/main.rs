mod api;
mod format;
mod services;
mod state;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use log::info;
use rocket::fairing::AdHoc;

use sluice_model::{Ingester, IngesterConfigs, ServerConfig, User};
use sluice_store::{Registry, connect_backend};

use crate::services::auth::AuthService;
use crate::services::limiter::RateLimiter;
use crate::state::AppState;
use crate::ws::Fanout;

async fn build_state() -> Arc<AppState> {
    let config = ServerConfig::load().expect("server config invalid");
    let registry = Registry::connect(&config.redis_url, &config.ns)
        .await
        .expect("registry unreachable at startup");
    let tsdb = connect_backend(&config.backend)
        .await
        .expect("storage backend unreachable at startup");

    // The API process loads the same declarative configs as the ingester
    // process to know the resource universe; sys.users rides along.
    let mut resources: HashMap<String, Ingester> = match IngesterConfigs::load_from_env() {
        Ok(configs) => configs
            .ingesters()
            .expect("ingester configs invalid")
            .into_iter()
            .map(|ing| (ing.name.clone(), ing))
            .collect(),
        Err(e) => {
            info!("no ingester configs for API process ({e}); serving sys tables only");
            HashMap::new()
        }
    };
    let users = User::users_ingester();
    resources.insert(users.name.clone(), users);

    let limiter = RateLimiter::new(registry.clone(), &config);
    let auth = AuthService::new(registry.clone(), tsdb.clone(), &config);
    let fanout = Arc::new(Fanout::new(config.ws.clone()));

    Arc::new(AppState {
        config,
        registry,
        tsdb,
        resources,
        limiter,
        auth,
        fanout,
    })
}

#[rocket::launch]
async fn rocket() -> _ {
    env_logger::init();
    let state = build_state().await;

    rocket::build()
        .manage(state)
        .mount("/", api::routes())
        .mount("/", rocket::routes![ws::endpoint])
        .attach(api::RateLimitFairing)
        .attach(AdHoc::on_liftoff("ws fan-out", |rocket| {
            Box::pin(async move {
                let state = rocket
                    .state::<Arc<AppState>>()
                    .expect("app state managed at build")
                    .clone();
                tokio::spawn(ws::run_listener(state.clone()));

                let lifetimes = state.clone();
                tokio::spawn(async move {
                    let mut tick = tokio::time::interval(Duration::from_secs(5 * 60));
                    loop {
                        tick.tick().await;
                        lifetimes.fanout.sweep_lifetimes().await;
                    }
                });
                let maintenance = state.clone();
                tokio::spawn(async move {
                    let mut tick = tokio::time::interval(Duration::from_secs(10 * 60));
                    loop {
                        tick.tick().await;
                        maintenance.fanout.sweep_maintenance().await;
                    }
                });
                info!("ws fan-out and sweeps started");
            })
        }))
}
