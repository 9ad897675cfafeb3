mod admin;
mod config;
mod credential;
mod error;
mod lifecycle;
mod payload;
mod poller;
mod policy;
mod provider;
mod signature;
mod store;
mod trigger;
mod types;
mod webhook;

use config::{LogFormat, Settings};
use credential::{CredentialBroker, OAuthRefresher};
use lifecycle::HookLifecycle;
use poller::Poller;
use provider::ProviderRegistry;
use provider::http::ReqwestTransport;
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket, routes};
use std::net::Ipv4Addr;
use std::sync::Arc;
use store::ResourceStore;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// State shared by every route.
pub struct AppState {
    pub settings: Settings,
    pub lifecycle: Arc<HookLifecycle>,
}

impl AppState {
    pub fn store(&self) -> &ResourceStore {
        self.lifecycle.store()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        self.lifecycle.registry()
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

pub fn build_rocket(state: AppState) -> Rocket<Build> {
    let port = state.settings.port;
    rocket::build()
        .manage(state)
        .mount("/", routes![webhook::receive])
        .mount(
            "/admin",
            routes![
                admin::list_watches,
                admin::apply_watch,
                admin::delete_watch,
                admin::apply_credential,
                admin::list_triggers,
                admin::set_handled
            ],
        )
        .configure(rocket::Config {
            port,
            address: Ipv4Addr::UNSPECIFIED.into(),
            ..rocket::Config::default()
        })
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::from_env()?;
    init_tracing(settings.log_format);

    let store = ResourceStore::in_memory();
    config::apply_seed(&store, config::load_seed(&settings.seed_file)?).await?;

    let transport = Arc::new(ReqwestTransport::new(settings.http_timeout)?);
    let registry = ProviderRegistry::from_settings(&settings, transport.clone());
    let broker = Arc::new(CredentialBroker::new(
        store.credentials.clone(),
        registry.clone(),
        Arc::new(OAuthRefresher::new(transport)),
    ));
    let lifecycle = Arc::new(HookLifecycle::new(store, registry, broker));
    let poller = Arc::new(Poller::new(lifecycle.clone()));

    let providers: Vec<_> = lifecycle.registry().kinds().collect();
    info!(
        port = settings.port,
        base_url = %settings.webhook_base_url,
        ?providers,
        "gitwatcher starting"
    );

    let (poll_every, reconcile_every) = (settings.poll_interval, settings.reconcile_interval);
    let seed_file = settings.seed_file.clone();
    let background = lifecycle.clone();
    build_rocket(AppState { settings, lifecycle })
        .attach(AdHoc::on_liftoff("Background loops", move |rocket| {
            let lifecycle = background.clone();
            let poller = poller.clone();
            let shutdown = rocket.shutdown();
            let seed_file = seed_file.clone();
            Box::pin(async move {
                tokio::spawn(config::persist_changes(lifecycle.store().clone(), seed_file, shutdown.clone()));
                tokio::spawn(lifecycle.run(shutdown.clone()));
                tokio::spawn(poller.run(poll_every, reconcile_every, shutdown));
            })
        }))
        .attach(AdHoc::on_shutdown("Save seed", |rocket| {
            Box::pin(async move {
                if let Some(state) = rocket.state::<AppState>() {
                    config::save_seed(state.store(), &state.settings.seed_file).await;
                }
            })
        }))
        .launch()
        .await
        .map_err(|e| anyhow::anyhow!("server failed: {e}"))?;
    Ok(())
}
