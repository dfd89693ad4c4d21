//! Typed wrappers over the job codes, one function per control-plane
//! operation. This is the surface the child application links against.
//!
//! `restart` blocks (it is called from synchronous teardown paths); the
//! rest are cooperative and belong inside the child's async runtime.

use serde_json::{Value, json};

use loadout_types::{ConstraintKind, RepoInfo, Update};

use crate::{Client, RpcResult, job};

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> RpcResult<T> {
    Ok(serde_json::from_value(value)?)
}

/// Request a restart; `hard` re-runs the whole materialization pipeline.
pub fn restart(client: &Client, hard: bool) -> RpcResult<()> {
    let code = if hard {
        job::HARD_RESTART
    } else {
        job::SOFT_RESTART
    };
    client.call(code, vec![]).map(|_| ())
}

pub async fn fetch_core(client: &Client) -> RpcResult<()> {
    client
        .call_cooperative(job::FETCH_CORE, vec![])
        .await
        .map(|_| ())
}

pub async fn fetch_repos(client: &Client) -> RpcResult<()> {
    client
        .call_cooperative(job::FETCH_REPOS, vec![])
        .await
        .map(|_| ())
}

pub async fn get_core(client: &Client) -> RpcResult<Option<RepoInfo>> {
    decode(client.call_cooperative(job::GET_CORE, vec![]).await?)
}

pub async fn get_repos(client: &Client) -> RpcResult<Vec<RepoInfo>> {
    decode(client.call_cooperative(job::GET_REPOS, vec![]).await?)
}

pub async fn add_repo(client: &Client, priority: i32, branch: &str, url: &str) -> RpcResult<()> {
    client
        .call_cooperative(job::ADD_REPO, vec![json!(priority), json!(branch), json!(url)])
        .await
        .map(|_| ())
}

pub async fn remove_repo(client: &Client, repo_id: i32) -> RpcResult<()> {
    client
        .call_cooperative(job::REMOVE_REPO, vec![json!(repo_id)])
        .await
        .map(|_| ())
}

pub async fn get_core_new_commits(client: &Client) -> RpcResult<Option<Vec<Update>>> {
    decode(client.call_cooperative(job::GET_CORE_NEW_COMMITS, vec![]).await?)
}

pub async fn get_core_old_commits(client: &Client, limit: u64) -> RpcResult<Option<Vec<Update>>> {
    decode(
        client
            .call_cooperative(job::GET_CORE_OLD_COMMITS, vec![json!(limit)])
            .await?,
    )
}

pub async fn get_repo_new_commits(client: &Client, repo_id: i32) -> RpcResult<Option<Vec<Update>>> {
    decode(
        client
            .call_cooperative(job::GET_REPO_NEW_COMMITS, vec![json!(repo_id)])
            .await?,
    )
}

pub async fn get_repo_old_commits(
    client: &Client,
    repo_id: i32,
    limit: u64,
) -> RpcResult<Option<Vec<Update>>> {
    decode(
        client
            .call_cooperative(job::GET_REPO_OLD_COMMITS, vec![json!(repo_id), json!(limit)])
            .await?,
    )
}

pub async fn set_core_branch(client: &Client, branch: &str) -> RpcResult<()> {
    client
        .call_cooperative(job::SET_CORE_BRANCH, vec![json!(branch)])
        .await
        .map(|_| ())
}

pub async fn set_core_version(client: &Client, version: &str) -> RpcResult<()> {
    client
        .call_cooperative(job::SET_CORE_VERSION, vec![json!(version)])
        .await
        .map(|_| ())
}

pub async fn set_repo_branch(client: &Client, repo_id: i32, branch: &str) -> RpcResult<()> {
    client
        .call_cooperative(job::SET_REPO_BRANCH, vec![json!(repo_id), json!(branch)])
        .await
        .map(|_| ())
}

pub async fn set_repo_version(client: &Client, repo_id: i32, version: &str) -> RpcResult<()> {
    client
        .call_cooperative(job::SET_REPO_VERSION, vec![json!(repo_id), json!(version)])
        .await
        .map(|_| ())
}

pub async fn set_repo_priority(client: &Client, repo_id: i32, priority: i32) -> RpcResult<()> {
    client
        .call_cooperative(job::SET_REPO_PRIORITY, vec![json!(repo_id), json!(priority)])
        .await
        .map(|_| ())
}

pub async fn add_constraints(
    client: &Client,
    kind: ConstraintKind,
    data: &[String],
) -> RpcResult<()> {
    client
        .call_cooperative(job::ADD_CONSTRAINTS, vec![json!(kind), json!(data)])
        .await
        .map(|_| ())
}

pub async fn remove_constraints(
    client: &Client,
    kind: Option<ConstraintKind>,
    data: &[String],
) -> RpcResult<()> {
    client
        .call_cooperative(job::REMOVE_CONSTRAINTS, vec![json!(kind), json!(data)])
        .await
        .map(|_| ())
}

pub async fn get_constraints(client: &Client) -> RpcResult<Vec<String>> {
    decode(client.call_cooperative(job::GET_CONSTRAINTS, vec![]).await?)
}

pub async fn clear_constraints(client: &Client, kind: Option<ConstraintKind>) -> RpcResult<()> {
    client
        .call_cooperative(job::CLEAR_CONSTRAINTS, vec![json!(kind)])
        .await
        .map(|_| ())
}

pub async fn invalidate_repos_cache(client: &Client) -> RpcResult<()> {
    client
        .call_cooperative(job::INVALIDATE_REPOS_CACHE, vec![])
        .await
        .map(|_| ())
}

pub async fn set_env(client: &Client, key: &str, value: &str) -> RpcResult<()> {
    client
        .call_cooperative(job::SET_ENV, vec![json!(key), json!(value)])
        .await
        .map(|_| ())
}

pub async fn unset_env(client: &Client, key: &str) -> RpcResult<()> {
    client
        .call_cooperative(job::UNSET_ENV, vec![json!(key)])
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Connection, Reply};
    use std::os::unix::net::UnixStream;

    #[tokio::test]
    async fn get_core_decodes_repo_info() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let mut server = Connection::new(b);

        let handle = std::thread::spawn(move || {
            let req = server.recv_request().expect("recv").expect("frame");
            assert_eq!(req.job, job::GET_CORE);

            let info = RepoInfo::new(-1, -1, "new", "", "https://github.com/a/core");
            server
                .send_reply(&Reply::Ok(serde_json::to_value(info).expect("encode")))
                .expect("send");
        });

        let client = Client::new(a);
        let info = get_core(&client).await.expect("call").expect("some");
        assert_eq!(info.branch, "new");
        assert_eq!(info.id, -1);

        handle.join().expect("server");
    }

    #[tokio::test]
    async fn get_core_decodes_null() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let mut server = Connection::new(b);

        let handle = std::thread::spawn(move || {
            let _ = server.recv_request().expect("recv");
            server
                .send_reply(&Reply::Ok(Value::Null))
                .expect("send");
        });

        let client = Client::new(a);
        assert!(get_core(&client).await.expect("call").is_none());

        handle.join().expect("server");
    }

    #[test]
    fn restart_is_blocking_and_unit() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let mut server = Connection::new(b);

        let handle = std::thread::spawn(move || {
            let req = server.recv_request().expect("recv").expect("frame");
            assert_eq!(req.job, job::HARD_RESTART);
            server.send_reply(&Reply::Ok(Value::Null)).expect("send");
        });

        let client = Client::new(a);
        restart(&client, true).expect("restart");

        handle.join().expect("server");
    }
}
