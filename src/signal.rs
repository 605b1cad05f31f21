//! OS signal subscription and routing.
//!
//! | signal            | action   |
//! |-------------------|----------|
//! | `SIGQUIT`, `SIGINT` | shutdown |
//! | `SIGHUP`, `SIGTERM` | restart  |
//!
//! Everything else is ignored.

use crate::error::{Error, Kind};
use crate::handle::Handle;
use crate::handoff::Handoff;
use std::{fmt, io, pin::pin, sync::Arc};
use tokio_stream::{Stream, StreamExt as _};
use tracing::{info, trace, warn};

/// A process signal as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Quit,
    Interrupt,
    Hangup,
    Terminate,
    /// Any other signal number. Never acted on.
    Other(i32),
}

/// What the router does in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Drain and exit.
    Shutdown,
    /// Hand the listener to a successor, then drain and exit.
    Restart,
}

impl Signal {
    /// The router's reaction to this signal, `None` when it is ignored.
    pub fn action(self) -> Option<Action> {
        match self {
            Signal::Quit | Signal::Interrupt => Some(Action::Shutdown),
            Signal::Hangup | Signal::Terminate => Some(Action::Restart),
            Signal::Other(_) => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Quit => f.write_str("SIGQUIT"),
            Signal::Interrupt => f.write_str("SIGINT"),
            Signal::Hangup => f.write_str("SIGHUP"),
            Signal::Terminate => f.write_str("SIGTERM"),
            Signal::Other(signo) => write!(f, "signal {signo}"),
        }
    }
}

/// Registers handlers for the four routed signals and merges them into one
/// stream.
///
/// On non-Unix targets only Ctrl-C is available, reported as
/// [`Signal::Interrupt`], so the server can drain but never restart.
#[cfg(unix)]
pub fn subscribe() -> io::Result<impl Stream<Item = Signal> + Send + 'static> {
    use tokio::signal::unix::{signal, SignalKind};
    use tokio_stream::wrappers::SignalStream;

    let stream = |kind: SignalKind, as_signal: Signal| -> io::Result<_> {
        Ok(SignalStream::new(signal(kind)?).map(move |()| as_signal))
    };

    let quit = stream(SignalKind::quit(), Signal::Quit)?;
    let interrupt = stream(SignalKind::interrupt(), Signal::Interrupt)?;
    let hangup = stream(SignalKind::hangup(), Signal::Hangup)?;
    let terminate = stream(SignalKind::terminate(), Signal::Terminate)?;

    Ok(quit.merge(interrupt).merge(hangup).merge(terminate))
}

#[cfg(not(unix))]
pub fn subscribe() -> io::Result<impl Stream<Item = Signal> + Send + 'static> {
    Ok(async_stream::stream! {
        while tokio::signal::ctrl_c().await.is_ok() {
            yield Signal::Interrupt;
        }
    })
}

/// Reacts to `signals` until one of them shuts the server down.
///
/// A restart spawns the successor first and only shuts down if that worked;
/// a failed spawn is logged and the server keeps serving as before. Returns
/// the action that ended routing, or `None` if the stream ran dry.
pub(crate) async fn route_signals<St, H>(signals: St, handoff: H, handle: Handle) -> Option<Action>
where
    St: Stream<Item = Signal> + Send,
    H: Handoff,
{
    let mut signals = pin!(signals);
    let handoff = Arc::new(handoff);

    while let Some(signal) = signals.next().await {
        let action = match signal.action() {
            Some(action) => action,
            None => {
                trace!(%signal, "ignoring signal");
                continue;
            }
        };

        info!(%signal, pid = std::process::id(), "received signal");

        if action == Action::Restart {
            match spawn_successor(&handoff).await {
                Ok(pid) => info!(pid, "successor spawned, shutting down"),
                Err(error) => {
                    warn!(%error, "graceful restart failed, still serving");
                    continue;
                }
            }
        }

        // Drain failures are logged by the handle and leave completion
        // unpublished.
        let _ = handle.shutdown().await;
        return Some(action);
    }

    trace!("signal stream ended");
    None
}

/// Runs the handoff on the blocking pool; fork and exec must not stall a
/// runtime worker.
async fn spawn_successor<H: Handoff>(handoff: &Arc<H>) -> Result<u32, Error> {
    let handoff = handoff.clone();

    tokio::task::spawn_blocking(move || handoff.spawn_successor())
        .await
        .unwrap_or_else(|e| Err(Error::new(Kind::Spawn).with(e)))
}
