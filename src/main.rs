mod config;
mod file_system;
mod handlers;
mod hub;
mod models;
mod sandbox;
mod watcher;

use actix_cors::Cors;
use actix_web::http::header;
use actix_web::{middleware, web, App, HttpServer};
use config::AppConfig;
use file_system::validate_path;
use handlers::AppState;
use hub::BroadcastHub;
use log::{info, warn};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use sandbox::Sandbox;
use std::env;
use std::fs::File as FsFile;
use std::io::{BufReader, Error, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use watcher::ChangeWatcher;

/// Upper bound on request bodies; well above the script size limit so the
/// sandbox, not the extractor, reports oversized scripts.
const JSON_BODY_LIMIT: usize = 256 * 1024;

fn load_tls_config(cert_path: &str, key_path: &str) -> std::io::Result<ServerConfig> {
    let cert_file = &mut BufReader::new(FsFile::open(cert_path)?);
    let key_file = &mut BufReader::new(FsFile::open(key_path)?);
    let cert_chain = certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    let mut keys = pkcs8_private_keys(key_file).collect::<Result<Vec<_>, _>>()?;

    if keys.is_empty() {
        return Err(Error::new(ErrorKind::Other, "No private keys found in key file"));
    }

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, keys.remove(0).into())
        .map_err(|e| Error::new(ErrorKind::Other, e))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    // Override the log level with RUST_LOG, e.g. `RUST_LOG=debug`.
    env::set_var("RUST_LOG", env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));
    env_logger::init();

    let config = AppConfig::from_env();
    let root = validate_path(&config.watch_root.to_string_lossy())
        .map_err(|e| Error::new(ErrorKind::NotFound, e))?;
    info!("Serving and watching {}", root.display());

    let hub = Arc::new(BroadcastHub::new(config.observer_buffer));
    let sandbox = Arc::new(Sandbox::new(config.sandbox.clone()));
    info!(
        "Sandbox: '{}' with {:?} timeout, scratch in {}",
        config.sandbox.interpreter,
        config.sandbox.timeout,
        config.sandbox.scratch_dir.display()
    );

    let watcher = ChangeWatcher::new(root.clone(), hub.clone());
    let _watch_task = watcher
        .start()
        .await
        .map_err(|e| Error::new(ErrorKind::Other, e))?;

    let state = web::Data::new(AppState {
        root,
        hub,
        sandbox,
        allowed_extensions: config.allowed_extensions.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let mut http_server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE, header::CACHE_CONTROL])
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(JSON_BODY_LIMIT))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .service(handlers::connect)
            .service(handlers::get_tree)
            .service(handlers::get_file_content)
            .service(handlers::execute)
            .service(handlers::events)
    });

    match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path))
            if Path::new(cert_path).exists() && Path::new(key_path).exists() =>
        {
            let tls = load_tls_config(cert_path, key_path)?;
            info!("Successfully configured TLS. Binding to https://{}", addr);
            http_server = http_server.bind_rustls_0_23(addr, tls)?;
        }
        (Some(_), Some(_)) => {
            warn!("CERT_PATH or KEY_PATH points to a non-existent file. Starting without HTTPS.");
            info!("Server running at http://{}", addr);
            http_server = http_server.bind(addr)?;
        }
        _ => {
            info!("No CERT_PATH or KEY_PATH found in env. Server running at http://{}", addr);
            http_server = http_server.bind(addr)?;
        }
    }

    http_server.run().await
}
