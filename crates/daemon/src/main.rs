use std::sync::Arc;

use packrat_core::{HttpExporter, S3ObjectStore, Settings, StatusTable};
use tracing::{info, warn};

mod routes;

use routes::AppState;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    packrat_core::init_logging();

    let settings = Settings::from_env();
    if let Err(e) = settings.validate() {
        // The daemon still serves status/list/download; backup jobs will
        // fail their pre-flight check until the environment is fixed.
        warn!(event = "daemon.config_incomplete", error = %e, "daemon.config_incomplete");
    }

    let store = Arc::new(S3ObjectStore::new(&settings).await);
    let exporter = Arc::new(HttpExporter::new(settings.content_store_url.clone()));

    let state = AppState {
        table: StatusTable::new(),
        exporter,
        store,
        settings: settings.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr).await?;
    info!(
        event = "daemon.listening",
        addr = %settings.listen_addr,
        bucket = %settings.bucket,
        region = %settings.region,
        "daemon.listening"
    );
    axum::serve(listener, routes::router(state)).await
}
