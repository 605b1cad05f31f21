use crate::error::{Error, Kind};
use crate::handle::Handle;
use crate::handoff::ListenerFd;
use crate::tls::SecureListener;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Descriptor slot at which a successor finds its inherited listener: the
/// first one after stdin, stdout and stderr.
pub const GRACEFUL_LISTENER_FD: i32 = 3;

/// Where the listening socket comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListenerSource {
    /// Cold start: bind a fresh socket to this address.
    Bind(String),
    /// Restart: adopt the socket already open at this descriptor.
    Inherit(i32),
}

/// The socket a server accepts on.
///
/// A secure listener wraps the plain one, so there is only ever one socket
/// and closing the wrapper closes it.
#[derive(Debug)]
pub enum Listener {
    Plain(TcpListener),
    Secure(SecureListener),
}

impl Listener {
    /// Address the underlying TCP socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// Whether connections are TLS-terminated before reaching hyper.
    pub fn is_secure(&self) -> bool {
        matches!(self, Listener::Secure(_))
    }

    /// The underlying socket, regardless of TLS.
    pub fn tcp(&self) -> &TcpListener {
        match self {
            Listener::Plain(listener) => listener,
            Listener::Secure(secure) => secure.get_ref(),
        }
    }

    pub(crate) fn into_parts(self) -> (TcpListener, Option<tokio_rustls::TlsAcceptor>) {
        match self {
            Listener::Plain(listener) => (listener, None),
            Listener::Secure(secure) => {
                let (listener, acceptor) = secure.into_parts();
                (listener, Some(acceptor))
            }
        }
    }
}

/// Acquires the listener for `source` and records a duplicate of its
/// descriptor on `handle` for a later handoff.
pub(crate) async fn acquire(source: &ListenerSource, handle: &Handle) -> Result<Listener, Error> {
    let listener = match source {
        ListenerSource::Bind(addr) => bind(addr).await?,
        ListenerSource::Inherit(fd) => inherit(*fd)?,
    };

    match ListenerFd::duplicate(&listener) {
        Ok(fd) => handle.set_listener_fd(Some(fd)),
        Err(error) => {
            warn!(%error, "listener descriptor unavailable, graceful restart disabled");
            handle.set_listener_fd(None);
        }
    }

    Ok(Listener::Plain(listener))
}

async fn bind(addr: &str) -> Result<TcpListener, Error> {
    if addr.is_empty() {
        return Err(Error::new(Kind::InvalidAddress).with("listen to empty address"));
    }

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        let kind = match e.kind() {
            io::ErrorKind::InvalidInput => Kind::InvalidAddress,
            _ => Kind::Bind,
        };
        Error::new(kind).with(e)
    })?;

    info!(addr = ?listener.local_addr().ok(), "bound fresh listener");
    Ok(listener)
}

#[cfg(unix)]
fn inherit(fd: i32) -> Result<TcpListener, Error> {
    use std::os::fd::FromRawFd;

    let inheritance_error = |source: io::Error| Error::new(Kind::DescriptorInheritance).with(source);

    if !is_listening_socket(fd) {
        return Err(Error::new(Kind::DescriptorInheritance)
            .with(format!("descriptor {fd} is not a listening socket")));
    }

    // Inherited without close-on-exec; other children must not get the socket.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
        return Err(inheritance_error(io::Error::last_os_error()));
    }

    // SAFETY: fd was validated as an open listening socket, and nothing else
    // in this process owns the inherited slot.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    let addr = std_listener.local_addr().map_err(inheritance_error)?;
    std_listener.set_nonblocking(true).map_err(inheritance_error)?;
    let listener = TcpListener::from_std(std_listener).map_err(inheritance_error)?;

    info!(fd, %addr, "inherited listener from parent process");
    Ok(listener)
}

#[cfg(not(unix))]
fn inherit(fd: i32) -> Result<TcpListener, Error> {
    Err(Error::new(Kind::DescriptorInheritance).with(format!(
        "cannot inherit descriptor {fd}: not supported on this platform"
    )))
}

/// Whether `fd` is an open socket in the listening state.
#[cfg(unix)]
pub(crate) fn is_listening_socket(fd: i32) -> bool {
    if fd < 0 {
        return false;
    }

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return false;
    }

    let mut accepting: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut accepting as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    result == 0 && accepting != 0
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, IntoRawFd};

    #[tokio::test]
    async fn empty_address_is_invalid() {
        let err = acquire(&ListenerSource::Bind(String::new()), &Handle::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Kind::InvalidAddress);
    }

    #[tokio::test]
    async fn address_without_port_is_invalid() {
        let err = acquire(&ListenerSource::Bind("127.0.0.1".into()), &Handle::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Kind::InvalidAddress);
    }

    #[tokio::test]
    async fn port_in_use_is_a_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let err = acquire(&ListenerSource::Bind(addr), &Handle::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Kind::Bind);
    }

    #[tokio::test]
    async fn cold_start_binds_and_records_descriptor() {
        let handle = Handle::new();
        let listener = acquire(&ListenerSource::Bind("127.0.0.1:0".into()), &handle)
            .await
            .unwrap();

        assert!(!listener.is_secure());
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert!(handle.with_listener_fd(|fd| fd.is_some()));
    }

    #[tokio::test]
    async fn inherits_listening_descriptor() {
        let original = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = original.local_addr().unwrap();
        let fd = original.try_clone().unwrap().into_raw_fd();

        let handle = Handle::new();
        let listener = acquire(&ListenerSource::Inherit(fd), &handle).await.unwrap();

        assert_eq!(listener.local_addr().unwrap(), addr);
        assert_eq!(listener.tcp().as_raw_fd(), fd);

        let client = tokio::net::TcpStream::connect(addr).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn rejects_descriptor_that_is_not_a_socket() {
        let file = std::fs::File::open("/dev/null").unwrap();

        let err = acquire(&ListenerSource::Inherit(file.as_raw_fd()), &Handle::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Kind::DescriptorInheritance);
    }

    #[tokio::test]
    async fn rejects_closed_descriptor() {
        let err = acquire(&ListenerSource::Inherit(9999), &Handle::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Kind::DescriptorInheritance);
    }

    #[test]
    fn connected_socket_is_not_listening() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        assert!(is_listening_socket(listener.as_raw_fd()));
        assert!(!is_listening_socket(stream.as_raw_fd()));
        assert!(!is_listening_socket(-1));
    }
}
