use actix_cors::Cors;
use actix_web::{middleware as actix_middleware, web, App, HttpResponse, HttpServer};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use mailflow::api;
use mailflow::config::Config;
use mailflow::core::{Core, CoreOptions};
use mailflow::middleware as app_middleware;
use mailflow::services::clock::SystemClock;
use mailflow::services::kv::RedisKv;
use mailflow::services::mailer::SmtpMailer;
use mailflow::services::store::PgStore;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("Failed to create pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let store = Arc::new(PgStore::new(Arc::new(pool)));
    let kv = Arc::new(
        RedisKv::connect(&config.redis_url)
            .await
            .expect("Failed to connect to Redis"),
    );
    let mailer = Arc::new(SmtpMailer::new(&config.smtp).expect("Failed to build SMTP transport"));
    let clock = Arc::new(SystemClock);

    let options = CoreOptions {
        sender: config.mailer_from.clone(),
        default_hourly_limit: config.max_emails_per_hour,
        pacing_floor: Duration::from_millis(config.delay_between_emails_ms),
        worker_concurrency: config.worker_concurrency,
        ..Default::default()
    };

    let core = web::Data::new(Core::new(store, kv, mailer, clock, options));
    core.start()
        .await
        .expect("Failed to recover queue from store");

    info!(addr = %config.bind_addr, workers = config.worker_concurrency, "mailflow listening");

    let server_core = core.clone();
    let frontend_url = config.frontend_url.clone();
    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend_url)
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![
                actix_web::http::header::CONTENT_TYPE,
                actix_web::http::header::ACCEPT,
            ])
            .allowed_header("x-user-id")
            .max_age(3600);

        App::new()
            .app_data(server_core.clone())
            .wrap(cors)
            .wrap(actix_middleware::Logger::default())
            .wrap(app_middleware::auth::AuthMiddleware)
            .configure(api::emails::configure)
            .route("/health", web::get().to(health))
    })
    .bind(config.bind_addr.as_str())?
    .run()
    .await?;

    core.shutdown().await;
    Ok(())
}

async fn health(core: web::Data<Core>) -> HttpResponse {
    if core.is_healthy() {
        HttpResponse::Ok().body("OK")
    } else {
        HttpResponse::ServiceUnavailable().body("store unavailable")
    }
}
