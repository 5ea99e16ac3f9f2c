mod routes;

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use petcam_common::config::Config;
use petcam_pipeline::broadcast::FrameHub;
use petcam_pipeline::motion::MotionDetector;
use petcam_pipeline::source::{DirSource, HttpSource};
use petcam_pipeline::store::FrameStore;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        mode = config.camera.mode,
        fps = config.camera.fps,
        min_interval_secs = config.persist.min_interval_secs,
        max_interval_secs = config.persist.max_interval_secs,
        retention_window_secs = config.retention.window_secs,
        "starting petcam"
    );

    let hub = Arc::new(FrameHub::new());
    let motion = Arc::new(MotionDetector::new(hub.clone(), &config.motion));
    let store = Arc::new(FrameStore::new(&config.persist, &config.retention));

    // No session state survives a restart.
    if let Err(e) = store.erase_all().await {
        error!(error = %e, "failed to clear persisted frames");
        std::process::exit(1);
    }

    let capture = {
        let hub = hub.clone();
        let camera = config.camera.clone();
        tokio::spawn(async move {
            match camera.mode.as_str() {
                "http" => {
                    let source = HttpSource::new(&camera.url, &camera.resolution, camera.fps);
                    hub.run(source).await;
                }
                "dir" => match DirSource::new(&camera.url, camera.fps) {
                    Ok(source) => hub.run(source).await,
                    Err(e) => error!(error = %e, "failed to open frame directory"),
                },
                other => {
                    error!(mode = other, "unknown camera mode, expected 'http' or 'dir'");
                }
            }
        })
    };

    {
        let motion = motion.clone();
        tokio::spawn(async move { motion.run().await });
    }
    let persist = {
        let store = store.clone();
        let hub = hub.clone();
        let motion = motion.clone();
        tokio::spawn(async move { store.run(&hub, &motion).await })
    };
    {
        let store = store.clone();
        tokio::spawn(async move { store.cull().await });
    }

    let app = routes::router(hub, motion, store, PathBuf::from(&config.server.web_root));

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr, "petcam server listening");

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        _ = capture => {
            info!("frame source ended, shutting down");
        }
        result = persist => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "frame persistence failed, shutting down");
            }
        }
    }
}
