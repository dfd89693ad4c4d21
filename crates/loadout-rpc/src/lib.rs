//! Control-plane RPC between the loader and its child process.
//!
//! The two processes share one duplex Unix-socket connection. Frames are a
//! 4-byte little-endian length followed by a JSON body: requests carry a
//! numeric job code plus positional arguments, replies carry either a value
//! or an error object that re-surfaces at the caller.
//!
//! The loader side serves requests through [`Connection`]; the child side
//! calls through [`client::Client`], which offers a blocking path and a
//! cooperatively-blocking path for use inside an async runtime.
//!
//! Request/reply pairing is strict: the k-th reply on the connection
//! answers the k-th request.

#![feature(unix_socket_peek)]

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod api;
pub mod client;

pub use client::Client;

/// Job codes understood by the loader's task registry.
pub mod job {
    pub const SOFT_RESTART: u32 = 1;
    pub const HARD_RESTART: u32 = 2;

    pub const FETCH_CORE: u32 = 3;
    pub const FETCH_REPOS: u32 = 4;

    pub const GET_CORE: u32 = 5;
    pub const GET_REPOS: u32 = 6;

    pub const ADD_REPO: u32 = 7;
    pub const REMOVE_REPO: u32 = 8;

    pub const GET_CORE_NEW_COMMITS: u32 = 9;
    pub const GET_CORE_OLD_COMMITS: u32 = 10;

    pub const GET_REPO_NEW_COMMITS: u32 = 11;
    pub const GET_REPO_OLD_COMMITS: u32 = 12;

    pub const SET_CORE_BRANCH: u32 = 13;
    pub const SET_CORE_VERSION: u32 = 14;

    pub const SET_REPO_BRANCH: u32 = 15;
    pub const SET_REPO_VERSION: u32 = 16;
    pub const SET_REPO_PRIORITY: u32 = 17;

    pub const ADD_CONSTRAINTS: u32 = 18;
    pub const REMOVE_CONSTRAINTS: u32 = 19;
    pub const GET_CONSTRAINTS: u32 = 20;
    pub const CLEAR_CONSTRAINTS: u32 = 21;

    pub const INVALIDATE_REPOS_CACHE: u32 = 22;

    pub const SET_ENV: u32 = 23;
    pub const UNSET_ENV: u32 = 24;
}

/// Transport and call failures.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The pipe is half-closed or closed; terminal for the in-flight call.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The remote handler returned an error object.
    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },
    /// A send was attempted while a reply was already pending.
    #[error("connection is being used")]
    Busy,
    /// Malformed frame on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type RpcResult<T> = Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::ConnectionLost(e.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Protocol(e.to_string())
    }
}

/// One request frame: a job code plus positional JSON arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub job: u32,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Request {
    pub fn new(job: u32, args: Vec<Value>) -> Self {
        Self { job, args }
    }
}

/// Error descriptor carried in a reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: String,
    pub message: String,
}

/// One reply frame: a value, or an error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply {
    Ok(Value),
    Err(ReplyError),
}

impl Reply {
    /// Turn the reply into the caller's result, re-raising error objects.
    pub fn into_result(self) -> RpcResult<Value> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Err(e) => Err(RpcError::Remote {
                kind: e.kind,
                message: e.message,
            }),
        }
    }
}

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

fn write_frame(stream: &mut UnixStream, body: &[u8]) -> RpcResult<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| RpcError::Protocol("frame too large".to_string()))?;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

fn read_frame(stream: &mut UnixStream) -> RpcResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(RpcError::Protocol(format!("frame of {len} bytes refused")));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    Ok(body)
}

/// One end of the duplex connection.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn send_request(&mut self, request: &Request) -> RpcResult<()> {
        write_frame(&mut self.stream, &serde_json::to_vec(request)?)
    }

    /// Receive the next request; `None` on a clean EOF.
    pub fn recv_request(&mut self) -> RpcResult<Option<Request>> {
        match read_frame(&mut self.stream) {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(RpcError::ConnectionLost(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn send_reply(&mut self, reply: &Reply) -> RpcResult<()> {
        write_frame(&mut self.stream, &serde_json::to_vec(reply)?)
    }

    pub fn recv_reply(&mut self) -> RpcResult<Reply> {
        let body = read_frame(&mut self.stream)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Whether a frame (or EOF) is ready to be read without blocking.
    pub fn poll(&self) -> RpcResult<bool> {
        self.stream.set_nonblocking(true)?;
        let mut probe = [0u8; 1];
        let ready = match self.stream.peek(&mut probe) {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(e) => {
                self.stream.set_nonblocking(false)?;
                return Err(e.into());
            }
        };
        self.stream.set_nonblocking(false)?;
        Ok(ready)
    }

    /// Close both directions; the peer observes EOF.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().expect("socketpair");
        (Connection::new(a), Connection::new(b))
    }

    #[test]
    fn request_roundtrip() {
        let (mut a, mut b) = pair();

        a.send_request(&Request::new(job::ADD_REPO, vec![0.into(), "main".into()]))
            .expect("send");

        let req = b.recv_request().expect("recv").expect("frame");
        assert_eq!(req.job, job::ADD_REPO);
        assert_eq!(req.args.len(), 2);
        assert_eq!(req.args[1], Value::from("main"));
    }

    #[test]
    fn reply_ok_roundtrip() {
        let (mut a, mut b) = pair();

        b.send_reply(&Reply::Ok(Value::from(42))).expect("send");
        let reply = a.recv_reply().expect("recv");
        assert_eq!(reply.into_result().expect("ok"), Value::from(42));
    }

    #[test]
    fn reply_error_resurfaces() {
        let (mut a, mut b) = pair();

        b.send_reply(&Reply::Err(ReplyError {
            kind: "unknown_job".to_string(),
            message: "no handler for job 99".to_string(),
        }))
        .expect("send");

        let err = a.recv_reply().expect("recv").into_result().unwrap_err();
        match err {
            RpcError::Remote { kind, .. } => assert_eq!(kind, "unknown_job"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn recv_request_none_on_eof() {
        let (a, mut b) = pair();
        drop(a);

        assert!(b.recv_request().expect("recv").is_none());
    }

    #[test]
    fn recv_reply_fails_on_eof() {
        let (a, mut b) = pair();
        drop(a);

        assert!(matches!(
            b.recv_reply().unwrap_err(),
            RpcError::ConnectionLost(_)
        ));
    }

    #[test]
    fn poll_sees_pending_frame() {
        let (mut a, b) = pair();

        assert!(!b.poll().expect("poll"));
        a.send_request(&Request::new(job::GET_CORE, vec![]))
            .expect("send");
        assert!(b.poll().expect("poll"));
    }

    #[test]
    fn wire_format_is_length_prefixed_json() {
        let (mut a, b) = pair();
        a.send_request(&Request::new(1, vec![])).expect("send");

        let mut raw = [0u8; 4];
        let mut stream = &b.stream;
        stream.read_exact(&mut raw).expect("len");
        let len = u32::from_le_bytes(raw) as usize;

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).expect("body");
        let parsed: Request = serde_json::from_slice(&body).expect("json");
        assert_eq!(parsed.job, 1);
    }

    #[test]
    fn oversized_frame_is_refused() {
        let (a, mut b) = pair();

        let mut stream = &a.stream;
        stream
            .write_all(&(MAX_FRAME_LEN + 1).to_le_bytes())
            .expect("len");

        assert!(matches!(b.recv_reply().unwrap_err(), RpcError::Protocol(_)));
    }
}
