//! Child process supervision and the RPC serve loop.
//!
//! The supervisor binds the control-plane socket, spawns the child with
//! `LOADOUT_SOCKET` in its environment, and serves requests until the
//! connection drops, the child dies, a handler asks for termination, or a
//! signal arrives. Signal handling is deliberately minimal: the watcher
//! thread only shuts the connection down, which unblocks the serve loop;
//! the loop itself terminates and reaps the child.
//!
//! Requests are served strictly in order on the main thread, so the child
//! observes a total order between each request and its reply.

use std::fs;
use std::os::unix::net::{UnixListener, UnixStream};
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use signal_hook::consts::signal::{SIGABRT, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};

use loadout_rpc::Connection;

use crate::Loader;
use crate::error::LoaderResult;
use crate::tasks::Tasks;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Restart bookkeeping across serve loops.
#[derive(Debug)]
pub struct Session {
    init: bool,
    restart: bool,
    terminate: bool,
    reexec: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            init: true,
            restart: false,
            terminate: false,
            reexec: false,
        }
    }

    /// True exactly once: on the first pass, or after a hard restart.
    pub fn should_init(&mut self) -> bool {
        std::mem::take(&mut self.init)
    }

    /// True once per requested restart.
    pub fn should_restart(&mut self) -> bool {
        std::mem::take(&mut self.restart)
    }

    /// Ask for a restart; `hard` re-runs the pipeline first.
    pub fn request_restart(&mut self, hard: bool) {
        self.init = hard;
        self.restart = true;
        self.terminate = true;
    }

    /// Ask the entry point to re-execute the host binary.
    pub fn request_reexec(&mut self) {
        self.reexec = true;
        self.terminate = true;
    }

    /// Whether the serve loop should stop after the current reply.
    pub fn take_terminate(&mut self) -> bool {
        std::mem::take(&mut self.terminate)
    }

    pub fn reexec_requested(&self) -> bool {
        self.reexec
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the child and serve its control-plane requests until it stops.
pub fn serve(loader: &mut Loader, tasks: &Tasks, child_cmd: &[String]) -> LoaderResult<()> {
    let socket_path = loader.layout.socket_path();
    let _ = fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)?;
    listener.set_nonblocking(true)?;

    info!(cmd = %child_cmd.join(" "), "starting child");
    let mut command = Command::new(&child_cmd[0]);
    command
        .args(&child_cmd[1..])
        .envs(loader.env.iter())
        .env("LOADOUT_SOCKET", &socket_path);
    let mut child = command.spawn()?;

    // The watcher's only actions: note the signal and close the pipe end.
    let conn_slot: Arc<Mutex<Option<UnixStream>>> = Arc::new(Mutex::new(None));
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGABRT])?;
    let signals_handle = signals.handle();
    let watcher = {
        let conn_slot = Arc::clone(&conn_slot);
        std::thread::spawn(move || {
            if signals.forever().next().is_some() {
                if let Ok(mut slot) = conn_slot.lock()
                    && let Some(stream) = slot.take()
                {
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                }
            }
        })
    };

    let outcome = serve_child(loader, tasks, &listener, &mut child, &conn_slot);

    if let Ok(mut slot) = conn_slot.lock()
        && let Some(stream) = slot.take()
    {
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }

    terminate_child(&mut child);
    let _ = child.wait();

    signals_handle.close();
    let _ = watcher.join();
    let _ = fs::remove_file(&socket_path);

    outcome
}

/// Ask the child to exit, escalating only if it ignores the request.
fn terminate_child(child: &mut Child) {
    if child.try_wait().ok().flatten().is_some() {
        return;
    }

    let _ = Command::new("kill").arg(child.id().to_string()).status();
    for _ in 0..20 {
        if child.try_wait().ok().flatten().is_some() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let _ = child.kill();
}

fn serve_child(
    loader: &mut Loader,
    tasks: &Tasks,
    listener: &UnixListener,
    child: &mut Child,
    conn_slot: &Arc<Mutex<Option<UnixStream>>>,
) -> LoaderResult<()> {
    // Wait for the child to connect; give up if it dies first.
    let stream = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if child.try_wait()?.is_some() {
                    warn!("child exited before connecting");
                    return Ok(());
                }
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => return Err(e.into()),
        }
    };

    stream.set_nonblocking(false)?;
    if let Ok(mut slot) = conn_slot.lock() {
        *slot = stream.try_clone().ok();
    }
    let mut conn = Connection::new(stream);

    loop {
        match conn.recv_request() {
            Ok(Some(request)) => {
                let reply = tasks.handle(loader, &request);
                if conn.send_reply(&reply).is_err() {
                    break;
                }
                if loader.session.take_terminate() {
                    break;
                }
            }
            // EOF or a torn connection both end the loop; the restart
            // flags decide what happens next.
            Ok(None) | Err(_) => break,
        }
    }

    conn.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::Env;
    use crate::layout::Layout;
    use loadout_rpc::{Client, RpcError, api, job};
    use serde_json::json;
    use tempfile::tempdir;

    fn loader_at(root: &std::path::Path) -> Loader {
        let env = Env::from_iter([
            ("API_ID", "12345"),
            ("API_HASH", "hash"),
            (
                "DATABASE_URL",
                root.join("db").to_str().expect("utf-8 path"),
            ),
            ("LOG_CHANNEL_ID", "-100"),
            ("SESSION_STRING", "session"),
        ]);

        Loader::new(Layout::new(root), env).expect("loader")
    }

    fn connect_client(socket: &std::path::Path) -> Client {
        for _ in 0..100 {
            if let Ok(client) = Client::connect(socket) {
                return client;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("loader socket never came up");
    }

    #[test]
    fn session_restart_flags() {
        let mut session = Session::new();
        assert!(session.should_init(), "first pass initializes");
        assert!(!session.should_init(), "only once");
        assert!(!session.should_restart());

        session.request_restart(true);
        assert!(session.take_terminate());
        assert!(!session.take_terminate());
        assert!(session.should_restart());
        assert!(session.should_init());

        session.request_restart(false);
        assert!(session.should_restart());
        assert!(!session.should_init());
    }

    #[test]
    fn session_reexec_flag() {
        let mut session = Session::new();
        assert!(!session.reexec_requested());
        session.request_reexec();
        assert!(session.reexec_requested());
        assert!(session.take_terminate());
    }

    #[test]
    fn serve_returns_when_child_dies_without_connecting() {
        let td = tempdir().expect("tempdir");
        let mut loader = loader_at(td.path());
        let tasks = Tasks::with_defaults();

        let cmd = vec!["true".to_string()];
        serve(&mut loader, &tasks, &cmd).expect("serve");
        assert!(!loader.layout.socket_path().exists(), "socket cleaned up");
    }

    #[test]
    fn serve_answers_requests_until_peer_hangs_up() {
        let td = tempdir().expect("tempdir");
        let mut loader = loader_at(td.path());
        let tasks = Tasks::with_defaults();
        let socket = loader.layout.socket_path();

        // a placeholder child; the test itself plays the RPC peer
        let cmd = vec!["sleep".to_string(), "30".to_string()];

        std::thread::scope(|scope| {
            let handle = scope.spawn(|| serve(&mut loader, &tasks, &cmd));

            let client = connect_client(&socket);

            let constraints = client
                .call(job::GET_CONSTRAINTS, vec![])
                .expect("get constraints");
            assert_eq!(constraints, json!([]));

            let info = client.call(job::GET_CORE, vec![]).expect("get core");
            assert_eq!(info["id"], json!(-1));

            drop(client); // EOF ends the serve loop and reaps the child
            handle.join().expect("join").expect("serve");
        });
    }

    #[test]
    fn restart_job_terminates_child_after_reply() {
        let td = tempdir().expect("tempdir");
        let mut loader = loader_at(td.path());
        let tasks = Tasks::with_defaults();
        let socket = loader.layout.socket_path();
        let cmd = vec!["sleep".to_string(), "30".to_string()];

        std::thread::scope(|scope| {
            let handle = scope.spawn(|| serve(&mut loader, &tasks, &cmd));

            let client = connect_client(&socket);
            api::restart(&client, true).expect("restart acknowledged");

            // the loop is gone now; the next call fails terminally
            let err = client.call(job::GET_CORE, vec![]).unwrap_err();
            assert!(matches!(err, RpcError::ConnectionLost(_) | RpcError::Busy));

            handle.join().expect("join").expect("serve");
        });

        assert!(loader.session.should_restart());
        assert!(loader.session.should_init());
    }
}
