//! Back-end repository interface.
//!
//! The upload service does not know how objects are stored; it hands the
//! finished temp file to a [`Repository`] implementation. Production
//! deployments bridge this trait to the storage back-end's RPC surface;
//! tests and the example server use in-memory implementations.

use std::path::Path;

use async_trait::async_trait;

/// Back-end error message for a rejected file name.
pub const ERR_INVALID_FILENAME: &str = "Invalid filename";
/// Back-end error message when the target name is already taken.
pub const ERR_FILE_EXISTS: &str = "file already exists";
/// Back-end error message when the update target is missing.
pub const ERR_FILE_NOT_EXIST: &str = "file does not exist";

/// Identity resolved from an upload access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessInfo {
    pub repo_id: String,
    pub user: String,
}

/// An error reported by the repository back-end.
///
/// The carried message is part of the interface: the upload handlers map
/// the known messages above to numeric redirect codes.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RepoError {
    message: String,
}

impl RepoError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

/// The repository RPC surface consumed by the upload service.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Resolves an opaque upload token to the target repository and user.
    async fn check_access_token(&self, token: &str) -> RepoResult<AccessInfo>;

    /// Fails when the repository is out of quota.
    async fn check_quota(&self, repo_id: &str) -> RepoResult<()>;

    /// Entry names of `parent_dir` in the repository's current head, used
    /// for upload name de-duplication.
    async fn list_dir(&self, repo_id: &str, parent_dir: &str) -> RepoResult<Vec<String>>;

    /// Ingests `src` as a new file `parent_dir/name`.
    async fn post_file(
        &self,
        repo_id: &str,
        src: &Path,
        parent_dir: &str,
        name: &str,
        user: &str,
    ) -> RepoResult<()>;

    /// Ingests `src` as a new revision of the existing file
    /// `parent_dir/name`.
    async fn put_file(
        &self,
        repo_id: &str,
        src: &Path,
        parent_dir: &str,
        name: &str,
        user: &str,
    ) -> RepoResult<()>;
}

#[async_trait]
impl<T: Repository + ?Sized> Repository for std::sync::Arc<T> {
    async fn check_access_token(&self, token: &str) -> RepoResult<AccessInfo> {
        (**self).check_access_token(token).await
    }

    async fn check_quota(&self, repo_id: &str) -> RepoResult<()> {
        (**self).check_quota(repo_id).await
    }

    async fn list_dir(&self, repo_id: &str, parent_dir: &str) -> RepoResult<Vec<String>> {
        (**self).list_dir(repo_id, parent_dir).await
    }

    async fn post_file(
        &self,
        repo_id: &str,
        src: &Path,
        parent_dir: &str,
        name: &str,
        user: &str,
    ) -> RepoResult<()> {
        (**self).post_file(repo_id, src, parent_dir, name, user).await
    }

    async fn put_file(
        &self,
        repo_id: &str,
        src: &Path,
        parent_dir: &str,
        name: &str,
        user: &str,
    ) -> RepoResult<()> {
        (**self).put_file(repo_id, src, parent_dir, name, user).await
    }
}
