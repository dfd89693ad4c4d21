//! Child-side call surface.
//!
//! Two ways to call the loader:
//!
//! - [`Client::call`] blocks the calling thread until the reply arrives.
//! - [`Client::call_cooperative`] is for async contexts: it holds an
//!   async-aware lock for the whole call and polls the pipe roughly twice a
//!   second instead of parking the thread.
//!
//! Lock order is always call-lock then transport-lock. Calls are strictly
//! serialized, so the k-th reply always answers the k-th request; a send
//! attempted while a reply is already pending fails with [`RpcError::Busy`].

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::{Connection, Request, RpcError, RpcResult};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Handle to the loader held by the child process.
#[derive(Debug)]
pub struct Client {
    transport: Mutex<Connection>,
    call_lock: tokio::sync::Mutex<()>,
}

impl Client {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            transport: Mutex::new(Connection::new(stream)),
            call_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Connect to the loader's socket, normally taken from the
    /// `LOADOUT_SOCKET` environment variable.
    pub fn connect(socket: &Path) -> RpcResult<Self> {
        let stream = UnixStream::connect(socket)?;
        Ok(Self::new(stream))
    }

    fn lock(&self) -> RpcResult<std::sync::MutexGuard<'_, Connection>> {
        self.transport
            .lock()
            .map_err(|_| RpcError::ConnectionLost("transport lock poisoned".to_string()))
    }

    fn send_checked(conn: &mut Connection, request: &Request) -> RpcResult<()> {
        if conn.poll()? {
            return Err(RpcError::Busy);
        }
        conn.send_request(request)
    }

    /// Send a request and block until the reply arrives.
    pub fn call(&self, job: u32, args: Vec<Value>) -> RpcResult<Value> {
        let mut conn = self.lock()?;
        Self::send_checked(&mut conn, &Request::new(job, args))?;
        conn.recv_reply()?.into_result()
    }

    /// Send a request and wait for the reply without blocking the runtime.
    ///
    /// The transport lock is only taken for the individual send, poll, and
    /// receive steps; the call lock keeps the request/reply pair atomic.
    pub async fn call_cooperative(&self, job: u32, args: Vec<Value>) -> RpcResult<Value> {
        let _serialized = self.call_lock.lock().await;

        {
            let mut conn = self.lock()?;
            Self::send_checked(&mut conn, &Request::new(job, args))?;
        }

        loop {
            {
                let conn = self.lock()?;
                if conn.poll()? {
                    break;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let reply = {
            let mut conn = self.lock()?;
            conn.recv_reply()?
        };
        reply.into_result()
    }

    /// Close the connection; in-flight and future calls fail terminally.
    pub fn close(&self) {
        if let Ok(conn) = self.lock() {
            conn.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Reply, job};

    /// Serve `count` requests on `conn`, echoing the job code back.
    fn echo_server(mut conn: Connection, count: usize) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            for _ in 0..count {
                let req = conn.recv_request().expect("recv").expect("frame");
                conn.send_reply(&Reply::Ok(Value::from(req.job))).expect("send");
            }
        })
    }

    fn client_and_server(count: usize) -> (Client, std::thread::JoinHandle<()>) {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let server = echo_server(Connection::new(b), count);
        (Client::new(a), server)
    }

    #[test]
    fn blocking_call_roundtrip() {
        let (client, server) = client_and_server(1);

        let value = client.call(job::GET_CORE, vec![]).expect("call");
        assert_eq!(value, Value::from(job::GET_CORE));

        server.join().expect("server");
    }

    #[test]
    fn blocking_calls_are_paired_in_order() {
        let (client, server) = client_and_server(3);

        for code in [job::FETCH_CORE, job::FETCH_REPOS, job::GET_REPOS] {
            let value = client.call(code, vec![]).expect("call");
            assert_eq!(value, Value::from(code));
        }

        server.join().expect("server");
    }

    #[test]
    fn call_on_closed_connection_is_terminal() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        drop(b);

        let client = Client::new(a);
        let err = client.call(job::GET_CORE, vec![]).unwrap_err();
        assert!(matches!(err, RpcError::ConnectionLost(_)));
    }

    #[test]
    fn unread_reply_marks_connection_busy() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let mut server = Connection::new(b);

        // a reply nobody asked for is sitting on the pipe
        server.send_reply(&Reply::Ok(Value::Null)).expect("send");

        let client = Client::new(a);
        // wait for delivery
        while !client.lock().expect("lock").poll().expect("poll") {
            std::thread::sleep(Duration::from_millis(5));
        }

        let err = client.call(job::GET_CORE, vec![]).unwrap_err();
        assert!(matches!(err, RpcError::Busy));
    }

    #[tokio::test]
    async fn cooperative_call_roundtrip() {
        let (client, server) = client_and_server(1);

        let value = client
            .call_cooperative(job::GET_REPOS, vec![])
            .await
            .expect("call");
        assert_eq!(value, Value::from(job::GET_REPOS));

        server.join().expect("server");
    }

    #[tokio::test]
    async fn cooperative_calls_serialize() {
        let (client, server) = client_and_server(2);
        let client = std::sync::Arc::new(client);

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.call_cooperative(job::FETCH_CORE, vec![]).await })
        };
        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.call_cooperative(job::FETCH_REPOS, vec![]).await })
        };

        let a = first.await.expect("join").expect("call");
        let b = second.await.expect("join").expect("call");
        assert_eq!(a, Value::from(job::FETCH_CORE));
        assert_eq!(b, Value::from(job::FETCH_REPOS));

        server.join().expect("server");
    }
}
