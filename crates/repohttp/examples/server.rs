//! Minimal upload server over an in-memory repository.
//!
//! ```bash
//! cargo run --example server
//! ```
//!
//! Then upload a file with the demo token:
//!
//! ```bash
//! curl -i -F parent_dir=/ -F file=@README.md \
//!     'http://127.0.0.1:8083/upload/demo?X-Progress-ID=p1'
//! ```
//!
//! and poll progress from another shell:
//!
//! ```bash
//! curl 'http://127.0.0.1:8083/upload_progress?X-Progress-ID=p1&callback=cb'
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;

use repohttp::repo::{ERR_FILE_EXISTS, ERR_FILE_NOT_EXIST};
use repohttp::{AccessInfo, RepoError, RepoResult, Repository, UploadConfig, UploadServiceBuilder};

/// Repository that only remembers which names exist per directory.
#[derive(Default)]
struct MemRepository {
    dirs: Mutex<HashMap<String, HashSet<String>>>,
}

#[async_trait::async_trait]
impl Repository for MemRepository {
    async fn check_access_token(&self, token: &str) -> RepoResult<AccessInfo> {
        if token == "demo" {
            Ok(AccessInfo {
                repo_id: "demo-repo".to_owned(),
                user: "demo@example.com".to_owned(),
            })
        } else {
            Err(RepoError::new("token not found"))
        }
    }

    async fn check_quota(&self, _repo_id: &str) -> RepoResult<()> {
        Ok(())
    }

    async fn list_dir(&self, _repo_id: &str, parent_dir: &str) -> RepoResult<Vec<String>> {
        let dirs = self.dirs.lock().unwrap();
        Ok(dirs
            .get(parent_dir)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn post_file(
        &self,
        _repo_id: &str,
        src: &Path,
        parent_dir: &str,
        name: &str,
        user: &str,
    ) -> RepoResult<()> {
        let size = tokio::fs::metadata(src)
            .await
            .map_err(|err| RepoError::new(err.to_string()))?
            .len();
        let mut dirs = self.dirs.lock().unwrap();
        let entries = dirs.entry(parent_dir.to_owned()).or_default();
        if !entries.insert(name.to_owned()) {
            return Err(RepoError::new(ERR_FILE_EXISTS));
        }
        tracing::info!("{user} uploaded {parent_dir}/{name} ({size} bytes)");
        Ok(())
    }

    async fn put_file(
        &self,
        _repo_id: &str,
        _src: &Path,
        parent_dir: &str,
        name: &str,
        user: &str,
    ) -> RepoResult<()> {
        let dirs = self.dirs.lock().unwrap();
        let exists = dirs
            .get(parent_dir)
            .is_some_and(|entries| entries.contains(name));
        if !exists {
            return Err(RepoError::new(ERR_FILE_NOT_EXIST));
        }
        tracing::info!("{user} updated {parent_dir}/{name}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut builder = UploadServiceBuilder::new(MemRepository::default());
    builder.set_config(UploadConfig::new().with_service_url("http://localhost:8000"));
    let service = builder.build()?;

    let addr = "127.0.0.1:8083";
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("upload server listening on http://{addr}");

    let http_server = ConnBuilder::new(TokioExecutor::new());
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

    loop {
        let (stream, remote_addr) = tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::error!("error accepting connection: {err}");
                        continue;
                    }
                }
            }
            _ = ctrl_c.as_mut() => {
                tracing::info!("received Ctrl+C, shutting down");
                break;
            }
        };

        tracing::debug!("accepted connection from {remote_addr}");

        let conn = http_server.serve_connection(TokioIo::new(stream), service.clone());
        let conn = conn.into_owned();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::error!("error serving connection: {err}");
            }
        });
    }

    Ok(())
}
