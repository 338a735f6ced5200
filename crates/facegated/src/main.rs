use anyhow::{Context, Result};
use facegate_core::FaceModel;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod admission;
mod config;
mod dbus_interface;
mod engine;
mod model_process;
mod service;
mod store;

use admission::AdmissionController;
use config::Config;
use dbus_interface::FacegateService;
use model_process::CommandExtractor;
use service::{FaceService, ServiceSettings};
use store::FaceGallery;

const BUS_NAME: &str = "org.facegate.Facegate1";
const OBJECT_PATH: &str = "/org/facegate/Facegate1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(?config, "facegated starting");

    let gallery = FaceGallery::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open gallery at {}", config.db_path.display()))?;

    let models: Vec<Box<dyn FaceModel>> = (0..config.extract_workers)
        .map(|_| {
            Box::new(CommandExtractor::new(
                config.extractor_cmd.clone(),
                config.extractor_args.clone(),
                config.extract_timeout(),
            )) as Box<dyn FaceModel>
        })
        .collect();
    let engine = engine::spawn_engine(models).context("failed to start extraction engine")?;

    let admission = AdmissionController::new(
        config.rate_limit,
        config.rate_window(),
        config.rate_max_clients,
    );
    let core = Arc::new(FaceService::new(
        gallery,
        engine,
        admission,
        ServiceSettings {
            match_threshold: config.match_threshold,
            duplicate_threshold: config.duplicate_threshold,
            extract_timeout: config.extract_timeout(),
        },
    ));

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FacegateService::new(Arc::clone(&core)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    // Idle clients are dropped once their window has fully elapsed.
    let sweeper = {
        let core = Arc::clone(&core);
        let period = config.rate_window().max(std::time::Duration::from_secs(1)) * 10;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                core.admission().sweep();
            }
        })
    };

    tracing::info!(
        bus = BUS_NAME,
        session = config.session_bus,
        faces = core.gallery().len(),
        workers = config.extract_workers,
        "facegated ready"
    );

    tokio::signal::ctrl_c().await?;
    sweeper.abort();
    tracing::info!("facegated shutting down");

    Ok(())
}
