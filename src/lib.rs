//! Zero-downtime restart and graceful shutdown for hyper servers.
//!
//! A [`Server`] binds its listening socket on a cold start, or inherits it
//! from the process that spawned it when [`GRACEFUL_ENV_KEY`] is set. While
//! serving it routes process signals:
//!
//! - `SIGINT` and `SIGQUIT` stop accepting, let in-flight connections finish
//!   and then return from the serve call.
//! - `SIGHUP` and `SIGTERM` spawn a successor process that receives the
//!   listening socket at descriptor [`GRACEFUL_LISTENER_FD`], then drain like
//!   a shutdown. If the successor can't be spawned the server keeps serving.
//!
//! The socket is never closed during a restart, so clients never see a
//! refused connection.
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use http_body_util::Full;
//! use hyper::{body::Incoming, Request, Response};
//! use hyper_graceful::{Server, ServerConfig};
//! use hyper_util::service::TowerToHyperService;
//! use std::convert::Infallible;
//!
//! async fn hello(_: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
//!     Ok(Response::new(Full::new(Bytes::from("Hello, World!"))))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hyper_graceful::Error> {
//!     let service = TowerToHyperService::new(tower::service_fn(hello));
//!     Server::new(ServerConfig::new("127.0.0.1:8080"), service)
//!         .listen_and_serve()
//!         .await
//! }
//! ```

mod error;
mod handle;
mod handoff;
mod http;
mod listener;
mod notify_once;
mod server;
mod service;
mod signal;
mod tcp;
mod tls;

pub use error::{Error, Kind};
pub use handle::Handle;
pub use handoff::{Successor, GRACEFUL_ENV_KEY};
pub use self::http::connection_builder;
pub use listener::{Listener, GRACEFUL_LISTENER_FD};
pub use server::{Server, ServerConfig};
pub use service::{WriteTimeout, WriteTimeoutElapsed, WriteTimeoutFuture};
pub use signal::{subscribe, Action, Signal};
pub use tcp::accept_incoming;
pub use tls::{load_certs, load_private_key, tls_config, wrap_tls, SecureListener};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
