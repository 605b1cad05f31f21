use crate::{
    error::{Error, Kind},
    handle::Handle,
    handoff::{self, ProcessHandoff, Successor, GRACEFUL_ENV_KEY},
    http,
    listener::{self, Listener, ListenerSource, GRACEFUL_LISTENER_FD},
    service::{WriteTimeout, WriteTimeoutFuture},
    signal::{self, Signal},
    tls, BoxError,
};
use ::http::{Request, Response};
use http_body::Body;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper_util::{rt::TokioExecutor, server::conn::auto::HttpServerConnExec};
use std::{fmt, path::Path, time::Duration};
use tokio_stream::Stream;
use tracing::info;

/// Settings for a [`Server`].
///
/// Every timeout defaults to `None`, meaning unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind on a cold start, e.g. `"0.0.0.0:8080"`. Ignored when
    /// the listener is inherited.
    pub addr: String,
    /// Limit for receiving a complete request head.
    pub read_timeout: Option<Duration>,
    /// Limit for producing a response once the request was dispatched.
    ///
    /// Only the time until the service returns its response is bounded.
    /// Streaming the response body afterwards is not covered, so a slow
    /// body or a slow reader can hold the connection past this limit.
    pub write_timeout: Option<Duration>,
    /// Limit for draining connections on shutdown. When it passes the
    /// shutdown fails and the serve loop keeps waiting.
    pub drain_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Config for `addr` with every timeout unset.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Sets [`read_timeout`](Self::read_timeout).
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Sets [`write_timeout`](Self::write_timeout).
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Sets [`drain_timeout`](Self::drain_timeout).
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }
}

/// An HTTP server that drains on `SIGINT`/`SIGQUIT` and hands its listening
/// socket to a freshly spawned successor on `SIGHUP`/`SIGTERM`.
///
/// Whether the listener is bound or inherited is decided once, at
/// construction, from the [`GRACEFUL_ENV_KEY`] environment variable.
pub struct Server<S> {
    config: ServerConfig,
    service: S,
    is_graceful: bool,
    inherit_fd: i32,
    listener: Option<Listener>,
    tls_config: Option<rustls::ServerConfig>,
    handle: Handle,
    successor: Option<Successor>,
}

impl<S> Server<S> {
    pub fn new(config: ServerConfig, service: S) -> Self {
        let is_graceful = handoff::marker_present(std::env::var_os(GRACEFUL_ENV_KEY));
        if is_graceful {
            info!(fd = GRACEFUL_LISTENER_FD, "started by graceful restart");
        }

        Self {
            config,
            service,
            is_graceful,
            inherit_fd: GRACEFUL_LISTENER_FD,
            listener: None,
            tls_config: None,
            handle: Handle::new(),
            successor: None,
        }
    }

    /// Provide a handle for outside control of the server.
    pub fn handle(mut self, handle: Handle) -> Self {
        if let Some(fd) = self.handle.take_listener_fd() {
            handle.set_listener_fd(Some(fd));
        }
        self.handle = handle;
        self
    }

    /// Base TLS configuration used by [`Server::listen_and_serve_tls`].
    ///
    /// Its settings are kept; the certificate is replaced by the given pair
    /// and ALPN defaults are only applied if it lists no protocols.
    pub fn tls_config(mut self, config: rustls::ServerConfig) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Process started on a graceful restart. Defaults to re-running the
    /// current program with its current arguments and environment.
    pub fn successor(mut self, successor: Successor) -> Self {
        self.successor = Some(successor);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether this process was started by a graceful restart.
    pub fn is_graceful(&self) -> bool {
        self.is_graceful
    }

    fn source(&self) -> ListenerSource {
        if self.is_graceful {
            ListenerSource::Inherit(self.inherit_fd)
        } else {
            ListenerSource::Bind(self.config.addr.clone())
        }
    }

    /// Binds or inherits the listener.
    ///
    /// Only the first call acquires a socket; later calls return the same
    /// listener.
    pub async fn init_listener(&mut self) -> Result<&Listener, Error> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => listener::acquire(&self.source(), &self.handle)
                .await
                .map_err(|e| self.startup_failed(e))?,
        };

        Ok(&*self.listener.insert(listener))
    }

    /// Acquires the listener and wraps it for TLS with the given PEM files.
    ///
    /// Calling this again swaps the certificate without touching the socket.
    pub async fn init_tls_listener(
        &mut self,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<&Listener, Error> {
        self.init_listener().await?;

        let tcp = match self.listener.take() {
            Some(Listener::Plain(listener)) => listener,
            Some(Listener::Secure(secure)) => secure.into_inner(),
            None => return Err(Error::new(Kind::Bind).with("listener was not initialized")),
        };
        let secure = tls::wrap_tls(tcp, cert_file, key_file, self.tls_config.clone())
            .map_err(|e| self.startup_failed(e))?;

        Ok(&*self.listener.insert(Listener::Secure(secure)))
    }

    /// Releases anyone waiting on [`Handle::listening`] with `None`.
    fn startup_failed(&self, error: Error) -> Error {
        self.handle.notify_listening(None);
        error
    }
}

impl<S, B> Server<S>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    TokioExecutor: HttpServerConnExec<WriteTimeoutFuture<S::Future>, B>,
{
    /// Acquires a plain listener and serves until shut down.
    pub async fn listen_and_serve(mut self) -> Result<(), Error> {
        self.init_listener().await?;
        self.serve().await
    }

    /// Acquires a TLS listener and serves until shut down.
    pub async fn listen_and_serve_tls(
        mut self,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<(), Error> {
        self.init_tls_listener(cert_file, key_file).await?;
        self.serve().await
    }

    /// Serves on the listener, routing the process's signals.
    pub async fn serve(self) -> Result<(), Error> {
        let signals = signal::subscribe()
            .map_err(|e| self.startup_failed(Error::new(Kind::Signal).with(e)))?;
        self.serve_with_signals(signals).await
    }

    /// Serves on the listener, routing signals taken from `signals`.
    ///
    /// The signal router runs on its own task. The accept loop runs until the
    /// handle stops it or it fails, and this then waits for the handle to
    /// report a completed drain before returning the accept loop's result.
    /// If the drain fails, it never returns.
    pub async fn serve_with_signals<St>(mut self, signals: St) -> Result<(), Error>
    where
        St: Stream<Item = Signal> + Send + 'static,
    {
        self.init_listener().await?;
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => return Err(Error::new(Kind::Bind).with("listener was not initialized")),
        };

        let handle = self.handle.clone();
        let pid = std::process::id();
        let addr = listener.local_addr().ok();

        handle.set_drain_timeout(self.config.drain_timeout);
        handle.notify_listening(addr);
        info!(pid, ?addr, secure = listener.is_secure(), "serving");

        let handoff = ProcessHandoff::new(handle.clone(), self.successor.take());
        tokio::spawn(signal::route_signals(signals, handoff, handle.clone()));

        let service = WriteTimeout::new(self.service, self.config.write_timeout);
        let builder = http::connection_builder(self.config.read_timeout);
        let result = http::serve_listener(listener, service, builder, &handle).await;

        info!(pid, "waiting for connections to close");
        handle.wait_complete().await;
        info!(pid, "serve loop finished");

        result
    }
}

impl<S> fmt::Debug for Server<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("is_graceful", &self.is_graceful)
            .field("listener", &self.listener)
            .field("handle", &self.handle)
            .field("successor", &self.successor)
            .finish_non_exhaustive()
    }
}
