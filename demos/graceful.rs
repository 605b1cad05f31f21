//! Hello-world server with graceful restart.
//!
//! ```text
//! cargo run --example graceful
//! kill -HUP <pid>    # hand the socket to a new process
//! kill -INT <pid>    # drain and exit
//! ```
//!
//! Set `CERT_FILE` and `KEY_FILE` to serve HTTPS, and `ADDR` to change the
//! listen address.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::service::TowerToHyperService;
use tracing::info;

use hyper_graceful::{Server, ServerConfig};

async fn hello(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    // Long enough to watch a restart drain it.
    if req.uri().path() == "/slow" {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    let body = format!("Hello from pid {}!\n", std::process::id());
    Ok(Response::new(Full::new(Bytes::from(body))))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let addr = std::env::var("ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let config = ServerConfig::new(addr)
        .with_read_timeout(Duration::from_secs(10))
        .with_write_timeout(Duration::from_secs(30));

    let service = TowerToHyperService::new(tower::service_fn(hello));
    let server = Server::new(config, service);
    info!(
        pid = std::process::id(),
        graceful = server.is_graceful(),
        "starting"
    );

    match (std::env::var("CERT_FILE"), std::env::var("KEY_FILE")) {
        (Ok(cert), Ok(key)) => {
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
            server.listen_and_serve_tls(cert, key).await?
        }
        _ => server.listen_and_serve().await?,
    }

    info!(pid = std::process::id(), "exiting");
    Ok(())
}
