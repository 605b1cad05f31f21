use crate::error::{Error, Kind};
use crate::handoff::ListenerFd;
use crate::notify_once::NotifyOnce;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shutdown coordinator shared by the serve loop, the signal router and callers.
///
/// Cloning is cheap; every clone drives the same server. Calling
/// [`Handle::shutdown`] stops the accept loop, closes the listener, lets
/// in-flight connections finish and then publishes the completion signal that
/// releases the serve loop.
#[derive(Clone, Debug, Default)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

#[derive(Debug, Default)]
struct HandleInner {
    addr: Mutex<Option<SocketAddr>>,
    addr_settled: AtomicBool,
    addr_notify: Notify,
    conn_count: AtomicUsize,
    conn_end: Notify,
    stop: CancellationToken,
    accepting: AtomicBool,
    accept_end: NotifyOnce,
    complete: NotifyOnce,
    drain_timeout: Mutex<Option<Duration>>,
    listener_fd: Mutex<Option<ListenerFd>>,
}

impl Handle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.inner.conn_count.load(Ordering::SeqCst)
    }

    /// Whether a shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Whether the drain finished and the completion signal was published.
    pub fn is_complete(&self) -> bool {
        self.inner.complete.is_notified()
    }

    /// Waits until the server is listening and returns its local address.
    ///
    /// Returns `None` if the server failed before it started listening, also
    /// when called after that failure.
    pub async fn listening(&self) -> Option<SocketAddr> {
        let notified = self.inner.addr_notify.notified();

        if let Some(addr) = *self.inner.addr.lock().unwrap() {
            return Some(addr);
        }
        if self.inner.addr_settled.load(Ordering::SeqCst) {
            return None;
        }

        notified.await;

        *self.inner.addr.lock().unwrap()
    }

    /// Waits for the completion signal.
    pub async fn wait_complete(&self) {
        self.inner.complete.notified().await
    }

    /// Gracefully shuts the server down.
    ///
    /// Stops accepting, closes the listener and waits for every active
    /// connection to finish. Completion is published exactly once no matter
    /// how many times this is called. There is no deadline unless one was
    /// configured with [`ServerConfig::with_drain_timeout`]; when it expires a
    /// [`Kind::Shutdown`] error is returned and completion is *not* published,
    /// so the serve loop keeps the process alive.
    ///
    /// [`ServerConfig::with_drain_timeout`]: crate::ServerConfig::with_drain_timeout
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.inner.stop.cancel();

        // The handoff duplicate keeps the socket open; drop it so the kernel
        // refuses new connections once the accept loop is gone. A restart
        // may hold the descriptor lock across fork/exec, so wait off-runtime.
        let handle = self.clone();
        let _ = tokio::task::spawn_blocking(move || drop(handle.take_listener_fd())).await;

        let deadline = *self.inner.drain_timeout.lock().unwrap();

        let drained = match deadline {
            Some(duration) => tokio::time::timeout(duration, self.wait_drained())
                .await
                .map_err(|elapsed| Error::new(Kind::Shutdown).with(elapsed)),
            None => {
                self.wait_drained().await;
                Ok(())
            }
        };

        if let Err(error) = drained {
            warn!(
                %error,
                remaining = self.connection_count(),
                "graceful shutdown failed, not publishing completion"
            );
            return Err(error);
        }

        if self.inner.complete.notify_waiters() {
            info!("graceful shutdown complete");
        } else {
            debug!("graceful shutdown already completed");
        }

        Ok(())
    }

    pub(crate) fn notify_listening(&self, addr: Option<SocketAddr>) {
        *self.inner.addr.lock().unwrap() = addr;
        self.inner.addr_settled.store(true, Ordering::SeqCst);
        self.inner.addr_notify.notify_waiters();
    }

    pub(crate) fn set_drain_timeout(&self, duration: Option<Duration>) {
        *self.inner.drain_timeout.lock().unwrap() = duration;
    }

    pub(crate) fn set_listener_fd(&self, fd: Option<ListenerFd>) {
        *self.inner.listener_fd.lock().unwrap() = fd;
    }

    pub(crate) fn take_listener_fd(&self) -> Option<ListenerFd> {
        self.inner.listener_fd.lock().unwrap().take()
    }

    /// Runs `f` with the descriptor held for handoff.
    ///
    /// The lock is held for the duration of `f`, so a concurrent shutdown
    /// can't close the descriptor halfway through a spawn.
    pub(crate) fn with_listener_fd<T>(&self, f: impl FnOnce(Option<&ListenerFd>) -> T) -> T {
        let guard = self.inner.listener_fd.lock().unwrap();
        f(guard.as_ref())
    }

    /// Marks the accept loop as running until the returned guard is dropped.
    pub(crate) fn accepting(&self) -> AcceptGuard {
        self.inner.accepting.store(true, Ordering::SeqCst);
        AcceptGuard {
            handle: self.clone(),
        }
    }

    pub(crate) fn watcher(&self) -> Watcher {
        Watcher::new(self.clone())
    }

    pub(crate) async fn wait_stop(&self) {
        self.inner.stop.cancelled().await
    }

    async fn wait_drained(&self) {
        if self.inner.accepting.load(Ordering::SeqCst) {
            self.inner.accept_end.notified().await;
        }

        loop {
            let notified = self.inner.conn_end.notified();

            if self.connection_count() == 0 {
                return;
            }

            debug!(
                connections = self.connection_count(),
                "waiting for connections to close"
            );
            notified.await;
        }
    }
}

/// Held by the accept loop; dropping it reports the listener as closed.
pub(crate) struct AcceptGuard {
    handle: Handle,
}

impl Drop for AcceptGuard {
    fn drop(&mut self) {
        self.handle.inner.accept_end.notify_waiters();
    }
}

/// Held by every connection task for as long as the connection is open.
pub(crate) struct Watcher {
    handle: Handle,
}

impl Watcher {
    fn new(handle: Handle) -> Self {
        handle.inner.conn_count.fetch_add(1, Ordering::SeqCst);
        Self { handle }
    }

    /// Resolves once the server stops accepting.
    pub(crate) async fn wait_graceful_shutdown(&self) {
        self.handle.wait_stop().await
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let count = self.handle.inner.conn_count.fetch_sub(1, Ordering::SeqCst) - 1;

        if count == 0 {
            self.handle.inner.conn_end.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn shutdown_without_connections_completes() {
        let handle = Handle::new();

        handle.shutdown().await.unwrap();

        assert!(handle.is_shutdown());
        assert!(handle.is_complete());
        timeout(Duration::from_millis(50), handle.wait_complete())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_connections() {
        let handle = Handle::new();
        let watcher = handle.watcher();
        assert_eq!(handle.connection_count(), 1);

        let shutdown = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.shutdown().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_shutdown());
        assert!(!handle.is_complete());

        // The connection sees the stop request and finishes.
        timeout(Duration::from_millis(50), watcher.wait_graceful_shutdown())
            .await
            .unwrap();
        drop(watcher);

        timeout(Duration::from_secs(1), shutdown)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(handle.is_complete());
        assert_eq!(handle.connection_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_accept_loop() {
        let handle = Handle::new();
        let accepting = handle.accepting();

        let shutdown = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.shutdown().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_complete());

        drop(accepting);

        timeout(Duration::from_secs(1), shutdown)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(handle.is_complete());
    }

    #[tokio::test]
    async fn repeated_shutdown_publishes_once() {
        let handle = Handle::new();

        let (first, second) = tokio::join!(handle.shutdown(), handle.shutdown());
        first.unwrap();
        second.unwrap();
        handle.shutdown().await.unwrap();

        assert!(handle.is_complete());
        // A second publication is refused.
        assert!(!handle.inner.complete.notify_waiters());
    }

    #[tokio::test]
    async fn drain_timeout_withholds_completion() {
        let handle = Handle::new();
        handle.set_drain_timeout(Some(Duration::from_millis(20)));
        let _watcher = handle.watcher();

        let err = handle.shutdown().await.unwrap_err();

        assert_eq!(err.kind(), Kind::Shutdown);
        assert!(!handle.is_complete());
        assert_eq!(handle.connection_count(), 1);
    }

    #[tokio::test]
    async fn listening_reports_address() {
        let handle = Handle::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], 4000));

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.listening().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.notify_listening(Some(addr));

        assert_eq!(waiter.await.unwrap(), Some(addr));
        assert_eq!(handle.listening().await, Some(addr));
    }

    #[tokio::test]
    async fn listening_reports_startup_failure() {
        let handle = Handle::new();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.listening().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.notify_listening(None);

        assert_eq!(waiter.await.unwrap(), None);
        // Late callers don't wait for an address that will never come.
        timeout(Duration::from_millis(50), handle.listening())
            .await
            .map(|addr| assert_eq!(addr, None))
            .unwrap();
    }
}
