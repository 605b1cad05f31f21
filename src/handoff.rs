//! Spawning a successor process that inherits the listening socket.
//!
//! The parent places a duplicate of its listener at [`GRACEFUL_LISTENER_FD`]
//! in the child and marks the child's environment with [`GRACEFUL_ENV_KEY`].
//! The child then rebuilds its listener from that slot instead of binding,
//! so the socket is never closed and no connection attempt is refused.

use crate::error::{Error, Kind};
use crate::handle::Handle;
use crate::listener::GRACEFUL_LISTENER_FD;
use std::ffi::OsString;
use std::path::PathBuf;
use std::{env, io};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Environment variable whose presence tells a process it was spawned by a
/// graceful restart and must inherit its listener.
pub const GRACEFUL_ENV_KEY: &str = "IS_GRACEFUL";

const GRACEFUL_ENV_VALUE: &str = "1";

/// Whether the marker value found in the environment turns inheritance on.
pub(crate) fn marker_present(value: Option<OsString>) -> bool {
    value.map_or(false, |value| !value.is_empty())
}

/// Builds a successor environment: every variable except the marker, then
/// exactly one fresh marker at the end.
pub(crate) fn successor_env<I>(vars: I) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<_> = vars
        .into_iter()
        .filter(|(key, _)| key != GRACEFUL_ENV_KEY)
        .collect();
    env.push((GRACEFUL_ENV_KEY.into(), GRACEFUL_ENV_VALUE.into()));
    env
}

/// The process image started on a graceful restart.
///
/// Defaults to the running program: the same `argv[0]`, the same arguments
/// and the environment at the time of the restart.
#[derive(Debug, Clone)]
pub struct Successor {
    program: PathBuf,
    args: Vec<OsString>,
    env: Option<Vec<(OsString, OsString)>>,
}

impl Successor {
    /// A successor running `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: None,
        }
    }

    /// Describes the current process.
    ///
    /// `argv[0]` is preferred over [`env::current_exe`] so that a binary
    /// replaced on disk is picked up by the successor.
    pub fn current() -> io::Result<Self> {
        let mut args = env::args_os();
        let program = match args.next() {
            Some(arg0) if !arg0.is_empty() => PathBuf::from(arg0),
            _ => env::current_exe()?,
        };

        Ok(Self {
            program,
            args: args.collect(),
            env: None,
        })
    }

    /// Replaces the argument list (not including `argv[0]`).
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Uses `vars` instead of the current environment as the base the
    /// graceful marker is added to.
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    /// Executable the successor runs.
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Arguments passed after the program name.
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    fn environment(&self) -> Vec<(OsString, OsString)> {
        match &self.env {
            Some(vars) => successor_env(vars.iter().cloned()),
            None => successor_env(env::vars_os()),
        }
    }
}

/// Starts a successor process that takes over the listening socket.
pub(crate) trait Handoff: Send + Sync + 'static {
    /// Spawns the successor and returns its process id.
    fn spawn_successor(&self) -> Result<u32, Error>;
}

/// The default [`Handoff`]: re-executes a [`Successor`] with the listener
/// descriptor recorded on the [`Handle`].
pub(crate) struct ProcessHandoff {
    handle: Handle,
    successor: Option<Successor>,
}

impl ProcessHandoff {
    pub(crate) fn new(handle: Handle, successor: Option<Successor>) -> Self {
        Self { handle, successor }
    }
}

impl Handoff for ProcessHandoff {
    fn spawn_successor(&self) -> Result<u32, Error> {
        let successor = match &self.successor {
            Some(successor) => successor.clone(),
            None => Successor::current().map_err(|e| Error::new(Kind::Spawn).with(e))?,
        };

        self.handle.with_listener_fd(|fd| {
            let fd = fd.ok_or_else(|| {
                Error::new(Kind::DescriptorExtraction)
                    .with("listener does not expose a descriptor")
            })?;
            spawn(fd, &successor)
        })
    }
}

/// A duplicate of the listening socket kept for handing to a successor.
#[derive(Debug)]
pub(crate) struct ListenerFd {
    #[cfg(unix)]
    fd: std::os::fd::OwnedFd,
}

#[cfg(unix)]
impl ListenerFd {
    pub(crate) fn duplicate(listener: &TcpListener) -> io::Result<Self> {
        use std::os::fd::AsFd;

        let fd = listener.as_fd().try_clone_to_owned()?;
        Ok(Self { fd })
    }
}

#[cfg(not(unix))]
impl ListenerFd {
    pub(crate) fn duplicate(_listener: &TcpListener) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "descriptor passing is not supported on this platform",
        ))
    }
}

#[cfg(unix)]
fn spawn(fd: &ListenerFd, successor: &Successor) -> Result<u32, Error> {
    use std::os::fd::AsRawFd;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let raw = fd.fd.as_raw_fd();

    if !crate::listener::is_listening_socket(raw) {
        return Err(Error::new(Kind::DescriptorExtraction)
            .with(format!("descriptor {raw} is not a listening socket")));
    }

    let mut command = Command::new(&successor.program);
    command
        .args(&successor.args)
        .env_clear()
        .envs(successor.environment())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // SAFETY: the closure only makes async-signal-safe calls (dup2, fcntl,
    // setsid) and does not allocate.
    unsafe {
        command.pre_exec(move || {
            place_listener(raw)?;
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    debug!(
        program = %successor.program.display(),
        fd = raw,
        slot = GRACEFUL_LISTENER_FD,
        "spawning successor"
    );

    let child = command
        .spawn()
        .map_err(|e| Error::new(Kind::Spawn).with(e))?;
    let pid = child.id();

    info!(pid, program = %successor.program.display(), "successor process started");

    Ok(pid)
}

/// Moves `fd` to the well-known slot in the child, without close-on-exec.
#[cfg(unix)]
fn place_listener(fd: std::os::fd::RawFd) -> io::Result<()> {
    if fd == GRACEFUL_LISTENER_FD {
        // dup2 onto itself is a no-op and would leave FD_CLOEXEC set.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
    } else if unsafe { libc::dup2(fd, GRACEFUL_LISTENER_FD) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn spawn(_fd: &ListenerFd, _successor: &Successor) -> Result<u32, Error> {
    Err(Error::new(Kind::Spawn).with("process handoff is not supported on this platform"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn count_markers(env: &[(OsString, OsString)]) -> usize {
        env.iter().filter(|(key, _)| key == GRACEFUL_ENV_KEY).count()
    }

    #[test]
    fn marker_requires_non_empty_value() {
        assert!(!marker_present(None));
        assert!(!marker_present(Some(OsString::new())));
        assert!(marker_present(Some("1".into())));
        assert!(marker_present(Some("yes".into())));
    }

    #[test]
    fn successor_env_appends_marker_once() {
        let env = successor_env(vec![("PATH".into(), "/usr/bin".into())]);
        assert_eq!(count_markers(&env), 1);
        assert_eq!(env.last().unwrap().0, GRACEFUL_ENV_KEY);
        assert_eq!(env[0], ("PATH".into(), "/usr/bin".into()));
    }

    #[test]
    fn successor_env_never_duplicates_marker() {
        let mut env = vec![("HOME".into(), "/root".into())];

        // Every restart feeds the previous successor's environment forward.
        for _ in 0..5 {
            env = successor_env(env);
            assert_eq!(count_markers(&env), 1);
        }

        let env = successor_env(vec![
            (GRACEFUL_ENV_KEY.into(), "1".into()),
            ("HOME".into(), "/root".into()),
            (GRACEFUL_ENV_KEY.into(), "stale".into()),
        ]);
        assert_eq!(count_markers(&env), 1);
        assert_eq!(
            env.last().unwrap(),
            &(GRACEFUL_ENV_KEY.into(), GRACEFUL_ENV_VALUE.into())
        );
    }

    #[test]
    fn current_successor_keeps_arguments() {
        let successor = Successor::current().unwrap();
        let args: Vec<OsString> = env::args_os().skip(1).collect();
        assert_eq!(successor.arguments(), args.as_slice());
    }

    #[tokio::test]
    async fn missing_descriptor_is_an_extraction_error() {
        let handoff = ProcessHandoff::new(Handle::new(), Some(Successor::new("/bin/true")));
        let err = handoff.spawn_successor().unwrap_err();
        assert_eq!(err.kind(), Kind::DescriptorExtraction);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = Handle::new();
        handle.set_listener_fd(Some(ListenerFd::duplicate(&listener).unwrap()));

        let handoff = ProcessHandoff::new(
            handle.clone(),
            Some(Successor::new("/nonexistent/hyper-graceful-successor")),
        );
        let err = handoff.spawn_successor().unwrap_err();
        assert_eq!(err.kind(), Kind::Spawn);

        // The descriptor is still there for the next attempt.
        assert!(handle.with_listener_fd(|fd| fd.is_some()));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn successor_inherits_socket_env_and_args() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = Handle::new();
        handle.set_listener_fd(Some(ListenerFd::duplicate(&listener).unwrap()));

        let out = env::temp_dir().join(format!("hyper-graceful-handoff-{}", std::process::id()));
        let _ = std::fs::remove_file(&out);

        let script = r#"
            {
                env | grep -c "^IS_GRACEFUL="
                readlink /proc/self/fd/3
                printf '%s\n' "$@"
            } > "$OUT.tmp" && mv "$OUT.tmp" "$OUT"
        "#;

        let successor = Successor::new("/bin/sh")
            .args(["-c", script, "successor", "--config", "server.toml"])
            .env([
                ("OUT", out.as_os_str().to_owned()),
                (GRACEFUL_ENV_KEY, OsString::from("1")),
                ("PATH", env::var_os("PATH").unwrap_or_default()),
            ]);

        let pid = ProcessHandoff::new(handle, Some(successor))
            .spawn_successor()
            .unwrap();
        assert!(pid > 0);

        let mut report = None;
        for _ in 0..200 {
            if let Ok(contents) = std::fs::read_to_string(&out) {
                report = Some(contents);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let report = report.expect("successor never wrote its report");
        let _ = std::fs::remove_file(&out);

        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], "1", "exactly one marker entry");
        assert!(lines[1].starts_with("socket:"), "slot 3 holds {}", lines[1]);
        assert_eq!(&lines[2..], ["--config", "server.toml"]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn default_successor_forwards_current_env_and_args() {
        use std::os::unix::fs::PermissionsExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = Handle::new();
        handle.set_listener_fd(Some(ListenerFd::duplicate(&listener).unwrap()));

        let dir = env::temp_dir();
        let tag = format!("hyper-graceful-default-{}", std::process::id());
        let out = dir.join(format!("{tag}.out"));
        let program = dir.join(format!("{tag}.sh"));
        let _ = std::fs::remove_file(&out);

        let script = format!(
            r#"#!/bin/sh
{{
    env | grep -c "^IS_GRACEFUL="
    readlink /proc/self/fd/3
    echo "${{PATH-unset}}"
    printf '%s\n' "$@"
}} > "{out}.tmp" && mv "{out}.tmp" "{out}"
"#,
            out = out.display()
        );
        std::fs::write(&program, script).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Only the program is redirected; arguments and environment are the
        // ones a plain restart would forward.
        let args = Successor::current().unwrap().arguments().to_vec();
        let successor = Successor::new(program.clone()).args(args);
        let handoff = ProcessHandoff::new(handle, Some(successor));

        // A concurrent fork elsewhere in the test binary can briefly hold the
        // freshly written script open (ETXTBSY).
        let mut spawned = handoff.spawn_successor();
        for _ in 0..10 {
            if spawned.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            spawned = handoff.spawn_successor();
        }
        assert!(spawned.unwrap() > 0);

        let mut report = None;
        for _ in 0..200 {
            if let Ok(contents) = std::fs::read_to_string(&out) {
                report = Some(contents);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let report = report.expect("successor never wrote its report");
        let _ = std::fs::remove_file(&out);
        let _ = std::fs::remove_file(&program);

        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], "1", "exactly one marker entry");
        assert!(lines[1].starts_with("socket:"), "slot 3 holds {}", lines[1]);
        assert_eq!(
            lines[2],
            env::var("PATH").unwrap_or_else(|_| "unset".to_owned())
        );

        let args: Vec<String> = env::args().skip(1).collect();
        assert_eq!(&lines[3..], args.as_slice());
    }
}
