//! Streaming upload front-end for a content-addressed file repository.
//!
//! `repohttp` implements the browser-facing upload endpoint of a file
//! repository service as a generic [hyper](https://hyper.rs) service.
//! Browsers POST `multipart/form-data` bodies; the service parses the body
//! incrementally, never buffering the whole request, spools the file
//! part to a temp file, tracks upload progress for a JSONP polling
//! endpoint, and hands the finished file to a back-end [`Repository`]
//! implementation.
//!
//! # Routes
//!
//! - `POST /upload/<token>?X-Progress-ID=<id>`: ingest a new file into
//!   the directory named by the `parent_dir` form field, de-duplicating
//!   the file name against the target directory.
//! - `POST /update/<token>?X-Progress-ID=<id>`: replace the file named by
//!   the `target_file` form field.
//! - `GET /upload_progress?X-Progress-ID=<id>&callback=<name>`: JSONP
//!   progress of an in-flight upload.
//!
//! Upload outcomes are reported as 302 redirects into the web front-end;
//! error pages receive a stable numeric code (see [`ErrorCode`]).
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use repohttp::{AccessInfo, RepoResult, Repository, UploadConfig, UploadServiceBuilder};
//!
//! struct MyRepo;
//!
//! #[async_trait::async_trait]
//! impl Repository for MyRepo {
//!     async fn check_access_token(&self, _token: &str) -> RepoResult<AccessInfo> {
//!         Ok(AccessInfo {
//!             repo_id: "repo-1".to_owned(),
//!             user: "alice@example.com".to_owned(),
//!         })
//!     }
//!     async fn check_quota(&self, _repo_id: &str) -> RepoResult<()> {
//!         Ok(())
//!     }
//!     async fn list_dir(&self, _repo_id: &str, _parent_dir: &str) -> RepoResult<Vec<String>> {
//!         Ok(Vec::new())
//!     }
//!     async fn post_file(
//!         &self,
//!         _repo_id: &str,
//!         _src: &Path,
//!         _parent_dir: &str,
//!         _name: &str,
//!         _user: &str,
//!     ) -> RepoResult<()> {
//!         Ok(())
//!     }
//!     async fn put_file(
//!         &self,
//!         _repo_id: &str,
//!         _src: &Path,
//!         _parent_dir: &str,
//!         _name: &str,
//!         _user: &str,
//!     ) -> RepoResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> std::io::Result<()> {
//! let mut builder = UploadServiceBuilder::new(MyRepo);
//! builder.set_config(UploadConfig::new().with_service_url("https://hub.example.com"));
//! let service = builder.build()?;
//! // Serve `service` with hyper; see examples/server.rs.
//! # let _ = service;
//! # Ok(())
//! # }
//! ```
//!
//! # Resource guarantees
//!
//! Per in-flight request the service holds at most one open temp file and
//! buffers O(chunk size + 10 KiB) of body data. On every termination path
//! (success, client error, server error, or the client disconnecting)
//! the temp file is unlinked and the progress entry removed.
//!
//! A request whose body ends without a file part is answered with a
//! redirect carrying the receive-error code rather than being treated as a
//! success.

mod error;
mod fsm;
mod handlers;
mod http;
mod temp_sink;

pub mod config;
pub mod progress;
pub mod repo;
pub mod service;

pub use self::config::UploadConfig;
pub use self::error::{ErrorCode, RecvError, StdError};
pub use self::repo::{AccessInfo, RepoError, RepoResult, Repository};
pub use self::service::{HttpResponse, UploadService, UploadServiceBuilder};
