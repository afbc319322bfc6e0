use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use std::sync::Arc;

mod archive;
mod config;
mod controllers;
mod crawler;
mod db;
mod error;
mod forwarding;
mod middleware;
mod models;
mod pool;
mod remote;
mod scheduler;

use config::{Config, CrawlConfig};
use db::Database;
use pool::{CredentialPool, EgressPool};
use remote::http::HttpRemoteClient;
use remote::Fetcher;
use scheduler::Scheduler;

pub struct AppState {
    pub db: Arc<Database>,
    pub config: Config,
    pub scheduler: Scheduler,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env();
    let port = config.port;

    log::info!("Loading crawl configuration from {:?}", config.crawl_config_path);
    let crawl = CrawlConfig::load(&config.crawl_config_path).expect("Failed to load crawl configuration");

    log::info!("Initializing database at {}", config.database_url);
    let db = Database::new(&config.database_url).expect("Failed to initialize database");
    let db = Arc::new(db);

    // Cooldowns and disables survive restarts
    let credentials = Arc::new(
        CredentialPool::new(crawl.credentials(), crawl.failure_threshold).with_rotation(crawl.rotation_mode),
    );
    match db.load_credential_statuses() {
        Ok(statuses) => credentials.restore(statuses),
        Err(e) => log::error!("[DB] failed to restore credential state: {}", e),
    }

    let routes = crawl.egress_routes();
    if routes.is_empty() {
        log::info!("No proxies configured, using direct egress");
    }
    let egress = Arc::new(EgressPool::new(routes, crawl.failure_threshold));

    log::info!("Remote bridge at {}", config.remote_endpoint);
    let client = Arc::new(HttpRemoteClient::new(&config.remote_endpoint, crawl.call_timeout()));
    let fetcher = Fetcher::new(client, crawl.call_timeout());

    let settings = crawl.scheduler_settings();
    log::info!(
        "Initializing scheduler: {} workers, {} credentials, max depth {}",
        settings.workers,
        credentials.len(),
        settings.max_depth
    );
    let scheduler = Scheduler::new(db.clone(), fetcher, credentials, egress, settings);
    scheduler.start();

    if config.control_token.is_none() {
        log::warn!("CONTROL_TOKEN not set, control API is unauthenticated");
    }
    log::info!("Starting Spectra control API on port {}", port);

    let sched = scheduler.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(AppState {
                db: Arc::clone(&db),
                config: config.clone(),
                scheduler: sched.clone(),
            }))
            .wrap(Logger::default())
            .configure(controllers::health::config)
            .configure(controllers::status::config)
            .configure(controllers::runs::config)
            .configure(controllers::archive::config)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    log::info!("Control API stopped, shutting down scheduler");
    scheduler.shutdown().await;
    server
}
