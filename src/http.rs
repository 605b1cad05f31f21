use crate::error::Error;
use crate::handle::{Handle, Watcher};
use crate::listener::Listener;
use crate::BoxError;
use std::{pin::pin, time::Duration};

use http::{Request, Response};
use http_body::Body;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto::{Builder as HttpConnectionBuilder, HttpServerConnExec},
};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt as _;
use tokio_util::either::Either;
use tracing::{debug, error, trace};

/// Builds the connection builder used for every accepted connection.
///
/// HTTP/1 and HTTP/2 are both served from the same socket. A `read_timeout`
/// bounds how long a client may take to send a complete request head; when it
/// is `None` no header timer is installed at all.
pub fn connection_builder(read_timeout: Option<Duration>) -> HttpConnectionBuilder<TokioExecutor> {
    let mut builder = HttpConnectionBuilder::new(TokioExecutor::new());

    builder
        .http1()
        .half_close(true)
        .keep_alive(true)
        .max_buf_size(64 * 1024)
        .http2()
        .adaptive_window(true)
        .max_concurrent_streams(Some(1000))
        .max_header_list_size(16 * 1024);

    if let Some(read_timeout) = read_timeout {
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(read_timeout);
    }

    builder
}

/// Serves one accepted connection on its own task.
///
/// The TLS handshake, when there is one, runs inside the task so a slow client
/// never stalls the accept loop. Once the handle stops accepting, the
/// connection is told to finish its in-flight request and close. `watcher` is
/// held until the connection is gone.
pub(crate) fn serve_connection<S, B, E>(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    service: S,
    builder: HttpConnectionBuilder<E>,
    watcher: Watcher,
) where
    S: Service<Request<Incoming>, Response = Response<B>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    E: HttpServerConnExec<S::Future, B> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        {
            let io = match acceptor {
                Some(acceptor) => {
                    tokio::select! {
                        biased;
                        handshake = acceptor.accept(stream) => match handshake {
                            Ok(tls) => Either::Right(tls),
                            Err(e) => {
                                debug!("TLS handshake failed: {:#}", e);
                                return;
                            }
                        },
                        _ = watcher.wait_graceful_shutdown() => {
                            trace!("shutdown before TLS handshake completed");
                            return;
                        }
                    }
                }
                None => Either::Left(stream),
            };

            let mut conn = pin!(builder.serve_connection_with_upgrades(TokioIo::new(io), service));
            let mut sig = pin!(watcher.wait_graceful_shutdown());
            let mut draining = false;

            loop {
                tokio::select! {
                    rv = &mut conn => {
                        if let Err(err) = rv {
                            debug!("failed serving HTTP connection: {:#}", err);
                        }
                        break;
                    },
                    _ = &mut sig, if !draining => {
                        trace!("draining connection");
                        conn.as_mut().graceful_shutdown();
                        draining = true;
                    }
                }
            }
        }

        drop(watcher);
        trace!("HTTP connection closed");
    });
}

/// The server engine's accept/dispatch loop.
///
/// Accepts on `listener` until the handle stops accepting, then closes the
/// listener and returns `Ok`. A fatal accept error closes the listener too
/// and is returned as a [`Kind::Transport`](crate::Kind::Transport) error.
/// Connections still in flight are left to finish on their own tasks; the
/// handle tracks them.
pub(crate) async fn serve_listener<S, B, E>(
    listener: Listener,
    service: S,
    builder: HttpConnectionBuilder<E>,
    handle: &Handle,
) -> Result<(), Error>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    E: HttpServerConnExec<S::Future, B> + Clone + Send + Sync + 'static,
{
    let accepting = handle.accepting();

    let (listener, acceptor) = listener.into_parts();
    let mut incoming = Box::pin(crate::tcp::accept_incoming(TcpListenerStream::new(
        listener,
    )));

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = handle.wait_stop() => {
                trace!("stop requested, closing listener");
                break Ok(());
            },
            next = incoming.next() => next,
        };

        match next {
            Some(Ok(stream)) => {
                trace!(peer = ?stream.peer_addr().ok(), "connection accepted");

                serve_connection(
                    stream,
                    acceptor.clone(),
                    service.clone(),
                    builder.clone(),
                    handle.watcher(),
                );
            }
            Some(Err(e)) => {
                error!(error = %e, "accept loop failed");
                break Err(Error::from_source(e));
            }
            None => break Ok(()),
        }
    };

    // Close the listener before reporting the accept loop as finished.
    drop(incoming);
    drop(accepting);

    result
}
