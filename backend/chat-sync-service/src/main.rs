use actix_web::{web, App, HttpServer};
use chat_sync_service::{config, error, logging, routes, state::AppState};
use std::time::Duration;

const LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = config::Config::from_env()?;
    let bind_addr = format!("{}:{}", cfg.host, cfg.port);

    let state = AppState::build(cfg).await?;
    tracing::info!(
        chats = state.store.chat_count(),
        page_size = state.config.sync.page_size,
        "chat state ready"
    );

    // Forget rate-limit buckets of idle users
    let sync = state.sync.clone();
    actix_web::rt::spawn(async move {
        let mut interval = actix_web::rt::time::interval(LIMITER_PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            sync.prune_limiter();
        }
    });

    tracing::info!(%bind_addr, "starting chat-sync-service");

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(actix_middleware::Logging)
            .wrap(actix_middleware::Identity)
            .wrap(actix_middleware::RequestId::new())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind REST: {e}")))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(format!("REST server: {e}")))
}
