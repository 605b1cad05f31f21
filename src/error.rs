use crate::BoxError;
use std::ops::ControlFlow;
use std::{error::Error as StdError, fmt, io};
use tracing::debug;

/// Decides whether an accept error ends the accept loop.
///
/// Transient errors ([`io::ErrorKind::ConnectionAborted`], [`io::ErrorKind::Interrupted`],
/// [`io::ErrorKind::InvalidData`], [`io::ErrorKind::WouldBlock`]) only skip the current
/// connection attempt. Everything else is fatal and is handed back to the caller.
pub(crate) fn handle_accept_error(e: impl Into<BoxError>) -> ControlFlow<BoxError> {
    let e = e.into();

    debug!(error = %e, "connection accept loop error");

    if let Some(e) = e.downcast_ref::<io::Error>() {
        if matches!(
            e.kind(),
            io::ErrorKind::ConnectionAborted
                | io::ErrorKind::Interrupted
                | io::ErrorKind::InvalidData
                | io::ErrorKind::WouldBlock
        ) {
            return ControlFlow::Continue(());
        }
    }

    ControlFlow::Break(e)
}

/// Errors produced while acquiring, serving, handing off or draining a listener.
pub struct Error {
    inner: ErrorImpl,
}

struct ErrorImpl {
    kind: Kind,
    source: Option<BoxError>,
}

/// The category of an [`Error`].
///
/// Startup kinds (`InvalidAddress`, `Bind`, `DescriptorInheritance`,
/// `CertificateLoad`, `Signal`) are fatal: the server never starts serving.
/// `Spawn` and `DescriptorExtraction` are raised by a restart attempt and are
/// recovered by the signal router. `Shutdown` is logged by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Kind {
    /// No bind address was configured for a cold start.
    InvalidAddress,
    /// The operating system refused to bind the listening socket.
    Bind,
    /// The inherited descriptor slot does not hold a listening socket.
    DescriptorInheritance,
    /// The active listener has no descriptor that can be passed to a successor.
    DescriptorExtraction,
    /// The certificate chain or private key could not be loaded.
    CertificateLoad,
    /// The successor process could not be started.
    Spawn,
    /// Connections did not drain.
    Shutdown,
    /// Subscribing to process signals failed.
    Signal,
    /// The accept loop hit a fatal error.
    Transport,
}

impl Error {
    /// An error of `kind` with no source attached.
    pub fn new(kind: Kind) -> Self {
        Self {
            inner: ErrorImpl { kind, source: None },
        }
    }

    /// Attaches a source error, consuming and returning `self`.
    pub fn with(mut self, source: impl Into<BoxError>) -> Self {
        self.inner.source = Some(source.into());
        self
    }

    /// Wraps a fatal accept loop error.
    pub fn from_source(source: impl Into<BoxError>) -> Self {
        Error::new(Kind::Transport).with(source)
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    fn description(&self) -> &str {
        match &self.inner.kind {
            Kind::InvalidAddress => "invalid listen address",
            Kind::Bind => "failed to bind listener",
            Kind::DescriptorInheritance => "failed to inherit listener descriptor",
            Kind::DescriptorExtraction => "failed to extract listener descriptor",
            Kind::CertificateLoad => "failed to load certificate pair",
            Kind::Spawn => "failed to spawn successor process",
            Kind::Shutdown => "graceful shutdown failed",
            Kind::Signal => "failed to subscribe to signals",
            Kind::Transport => "transport error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("hyper_graceful::Error");

        f.field(&self.inner.kind);

        if let Some(source) = &self.inner.source {
            f.field(source);
        }

        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.source {
            Some(source) => write!(f, "{}: {}", self.description(), source),
            None => f.write_str(self.description()),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|source| &**source as &(dyn StdError + 'static))
    }
}
