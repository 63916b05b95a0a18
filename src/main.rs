use turnkeeper::config::Settings;
use turnkeeper::core::autosave::AutoSave;
use turnkeeper::core::logging;
use turnkeeper::server::{build_router, AppState};
use turnkeeper::storage::build_storage;

#[tokio::main]
async fn main() {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = settings.validate() {
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    }

    let _log_guard = logging::init(&settings.data_root);
    tracing::info!(
        version = turnkeeper::VERSION,
        backend = ?settings.backend,
        data_root = %settings.data_root.display(),
        "turnkeeper starting"
    );

    let storage = match build_storage(&settings).await {
        Ok(storage) => storage,
        Err(e) => {
            tracing::error!(error = %e, "storage initialization failed");
            std::process::exit(1);
        }
    };

    let mut auto_save = AutoSave::spawn(storage.clone(), settings.auto_save_secs);

    let bind_addr = settings.bind_addr;
    let state = AppState::new(settings, storage);
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %bind_addr, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %bind_addr, "listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await;

    auto_save.stop();

    if let Err(e) = result {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
