//! Write-timeout wrapper for hyper services.

use crate::BoxError;
use hyper::service::Service;
use pin_project::pin_project;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{sleep, Sleep};

/// Bounds the time a service may take to produce a response.
///
/// When the limit passes before the inner future resolves, the call fails
/// with [`WriteTimeoutElapsed`] and hyper closes the connection. A `None`
/// limit passes every call through untouched.
///
/// The limit ends once the response head is handed to hyper; body frames
/// streamed after that are not timed.
#[derive(Clone, Debug)]
pub struct WriteTimeout<S> {
    inner: S,
    limit: Option<Duration>,
}

impl<S> WriteTimeout<S> {
    /// Wraps `inner`, bounding each call by `limit`.
    pub fn new(inner: S, limit: Option<Duration>) -> Self {
        Self { inner, limit }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, R> Service<R> for WriteTimeout<S>
where
    S: Service<R>,
    S::Error: Into<BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = WriteTimeoutFuture<S::Future>;

    fn call(&self, req: R) -> Self::Future {
        WriteTimeoutFuture {
            inner: self.inner.call(req),
            sleep: self.limit.map(sleep),
            limit: self.limit.unwrap_or_default(),
        }
    }
}

/// Response future of [`WriteTimeout`].
#[pin_project]
#[derive(Debug)]
pub struct WriteTimeoutFuture<F> {
    #[pin]
    inner: F,
    #[pin]
    sleep: Option<Sleep>,
    limit: Duration,
}

impl<F, T, E> Future for WriteTimeoutFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(result) = this.inner.poll(cx) {
            return Poll::Ready(result.map_err(Into::into));
        }

        match this.sleep.as_pin_mut().map(|sleep| sleep.poll(cx)) {
            Some(Poll::Ready(())) => {
                Poll::Ready(Err(Box::new(WriteTimeoutElapsed { limit: *this.limit })))
            }
            _ => Poll::Pending,
        }
    }
}

/// The response was not produced within the write timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTimeoutElapsed {
    limit: Duration,
}

impl WriteTimeoutElapsed {
    /// The limit that was exceeded.
    pub fn limit(&self) -> Duration {
        self.limit
    }
}

impl fmt::Display for WriteTimeoutElapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response not written within {:?}", self.limit)
    }
}

impl std::error::Error for WriteTimeoutElapsed {}
