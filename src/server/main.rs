use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use keywarden::config::get_config;
use keywarden::errors::{ServiceError, ServiceResult};
use keywarden::server::{build_router, AppState, Database, StoreProductResolver, TokenIssuer};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("keywarden_server failed to start: {e}");
        std::process::exit(1);
    }
}

async fn run() -> ServiceResult<()> {
    let config = get_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    if config.auth.admin_password.is_empty() {
        return Err(ServiceError::Config(
            "auth.admin_password must be set (config.toml or KEYWARDEN_ADMIN_PASSWORD)"
                .to_string(),
        ));
    }

    let issuer = Arc::new(TokenIssuer::from_config(&config.auth)?);

    let db = Database::new().await?;
    db.init_schema().await?;

    let state = AppState {
        products: Arc::new(StoreProductResolver::new(db.clone())),
        db,
        issuer,
    };

    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServiceError::Internal(format!("failed to bind {addr}: {e}")))?;

    info!("keywarden listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|e| ServiceError::Internal(format!("server error: {e}")))
}
