use crate::error::handle_accept_error;
use crate::BoxError;
use std::ops::ControlFlow;
use tokio_stream::{Stream, StreamExt};

/// Filters an accept stream down to usable connections.
///
/// Transient accept errors are dropped and the stream keeps going. The first
/// fatal error is yielded once and then the stream ends, which tears down the
/// accept loop that is driving it.
///
/// ```rust,no_run
/// use tokio::net::TcpListener;
/// use tokio_stream::wrappers::TcpListenerStream;
/// use hyper_graceful::accept_incoming;
///
/// # async fn run() -> std::io::Result<()> {
/// let listener = TcpListener::bind("127.0.0.1:0").await?;
/// let connections = accept_incoming(TcpListenerStream::new(listener));
/// # drop(connections);
/// # Ok(())
/// # }
/// ```
#[inline]
pub fn accept_incoming<IO, IE>(
    incoming: impl Stream<Item = Result<IO, IE>> + Send + 'static,
) -> impl Stream<Item = Result<IO, BoxError>>
where
    IO: Send + 'static,
    IE: Into<BoxError> + Send + 'static,
{
    async_stream::stream! {
        let mut incoming = Box::pin(incoming);

        while let Some(item) = incoming.next().await {
            match item {
                Ok(io) => yield Ok(io),
                Err(e) => match handle_accept_error(e) {
                    ControlFlow::Continue(()) => continue,
                    ControlFlow::Break(e) => {
                        yield Err(e);
                        break;
                    }
                },
            }
        }
    }
}
