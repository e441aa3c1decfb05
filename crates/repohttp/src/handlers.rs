//! Post-body upload and update handlers.
//!
//! Both handlers run after the body has been fully received: they validate
//! the spooled temp file, consult the repository back-end, and answer with
//! a 302 redirect into the web front-end: a browse page on success, an
//! error page carrying a numeric code on failure.

use std::path::Path;

use hyper::StatusCode;
use hyper::header::{self, HeaderValue};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::warn;

use crate::config::UploadConfig;
use crate::error::ErrorCode;
use crate::fsm::RecvFsm;
use crate::repo::{self, Repository};
use crate::service::{HttpResponse, plain_response};

/// Escape set matching the conventional URI escaping of the front-end:
/// everything outside the unreserved characters is percent-encoded.
const URI_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn escape(s: &str) -> String {
    utf8_percent_encode(s, URI_ESCAPE).to_string()
}

fn redirect(url: String) -> HttpResponse {
    match HeaderValue::try_from(url) {
        Ok(location) => {
            let mut resp = plain_response(StatusCode::FOUND, "");
            resp.headers_mut().insert(header::LOCATION, location);
            resp
        }
        Err(_) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error\n"),
    }
}

fn success_url(config: &UploadConfig, repo_id: &str, parent_dir: &str) -> String {
    format!(
        "{}/repo/{}?p={}",
        config.service_url,
        repo_id,
        escape(parent_dir)
    )
}

fn upload_error_url(
    config: &UploadConfig,
    repo_id: &str,
    parent_dir: &str,
    file_name: &str,
    code: ErrorCode,
) -> String {
    format!(
        "{}/repo/upload_error/{}?p={}&fn={}&err={}",
        config.service_url,
        repo_id,
        escape(parent_dir),
        escape(file_name),
        code.code()
    )
}

fn update_error_url(
    config: &UploadConfig,
    repo_id: &str,
    target_file: &str,
    code: ErrorCode,
) -> String {
    format!(
        "{}/repo/update_error/{}?p={}&err={}",
        config.service_url,
        repo_id,
        escape(target_file),
        code.code()
    )
}

/// Handles a finished `POST /upload/<token>` body.
pub(crate) async fn upload(
    repo: &dyn Repository,
    config: &UploadConfig,
    fsm: &RecvFsm,
) -> HttpResponse {
    let Some(parent_dir) = fsm.form_value("parent_dir") else {
        warn!("no parent dir given");
        return plain_response(StatusCode::BAD_REQUEST, "Invalid URL.\n");
    };

    match try_upload(repo, config, fsm, parent_dir).await {
        Ok(()) => redirect(success_url(config, fsm.repo_id(), parent_dir)),
        Err(code) => {
            let file_name = fsm.file_name().unwrap_or_default();
            redirect(upload_error_url(
                config,
                fsm.repo_id(),
                parent_dir,
                file_name,
                code,
            ))
        }
    }
}

async fn try_upload(
    repo: &dyn Repository,
    config: &UploadConfig,
    fsm: &RecvFsm,
    parent_dir: &str,
) -> Result<(), ErrorCode> {
    let (tmp_path, size) = stat_temp_file(fsm)?;
    check_size(size, config)?;
    check_quota(repo, fsm.repo_id()).await?;

    let entries = repo
        .list_dir(fsm.repo_id(), parent_dir)
        .await
        .map_err(|err| {
            warn!("cannot list {parent_dir}: {err}");
            ErrorCode::Internal
        })?;

    let file_name = fsm.file_name().ok_or(ErrorCode::Recv)?;
    let unique_name = gen_unique_filename(&entries, file_name);

    repo.post_file(fsm.repo_id(), tmp_path, parent_dir, &unique_name, fsm.user())
        .await
        .map_err(|err| {
            warn!("post file failed: {err}");
            match err.message() {
                repo::ERR_INVALID_FILENAME => ErrorCode::Filename,
                repo::ERR_FILE_EXISTS => ErrorCode::Exists,
                _ => ErrorCode::Internal,
            }
        })
}

/// Handles a finished `POST /update/<token>` body.
pub(crate) async fn update(
    repo: &dyn Repository,
    config: &UploadConfig,
    fsm: &RecvFsm,
) -> HttpResponse {
    let Some(target_file) = fsm.form_value("target_file") else {
        warn!("no target file given");
        return plain_response(StatusCode::BAD_REQUEST, "Invalid URL.\n");
    };

    let path = Path::new(target_file);
    let parent_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().into_owned(),
        _ => "/".to_owned(),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match try_update(repo, config, fsm, &parent_dir, &file_name).await {
        Ok(()) => redirect(success_url(config, fsm.repo_id(), &parent_dir)),
        Err(code) => redirect(update_error_url(config, fsm.repo_id(), target_file, code)),
    }
}

async fn try_update(
    repo: &dyn Repository,
    config: &UploadConfig,
    fsm: &RecvFsm,
    parent_dir: &str,
    file_name: &str,
) -> Result<(), ErrorCode> {
    let (tmp_path, size) = stat_temp_file(fsm)?;
    check_size(size, config)?;
    check_quota(repo, fsm.repo_id()).await?;

    repo.put_file(fsm.repo_id(), tmp_path, parent_dir, file_name, fsm.user())
        .await
        .map_err(|err| {
            warn!("put file failed: {err}");
            match err.message() {
                repo::ERR_FILE_NOT_EXIST => ErrorCode::NotExist,
                _ => ErrorCode::Internal,
            }
        })
}

/// The temp file's path and size. A request that never produced a file
/// part, or whose temp file cannot be stat'ed, is a receive failure.
fn stat_temp_file(fsm: &RecvFsm) -> Result<(&Path, u64), ErrorCode> {
    let Some(sink) = fsm.sink() else {
        warn!("no file content received");
        return Err(ErrorCode::Recv);
    };
    let size = sink.size().map_err(|err| {
        warn!("failed to stat temp file {}: {err}", sink.path().display());
        ErrorCode::Recv
    })?;
    Ok((sink.path(), size))
}

fn check_size(size: u64, config: &UploadConfig) -> Result<(), ErrorCode> {
    if size > config.max_upload_file_size {
        warn!("file size {size} is too large");
        return Err(ErrorCode::Size);
    }
    Ok(())
}

async fn check_quota(repo: &dyn Repository, repo_id: &str) -> Result<(), ErrorCode> {
    repo.check_quota(repo_id).await.map_err(|err| {
        warn!("out of quota: {err}");
        ErrorCode::Quota
    })
}

/// Picks a name that does not collide with `entries`, starting from
/// `filename` and appending ` (1)`, ` (2)`, … before the extension. The
/// probe gives up after the 16th candidate and returns it even if it still
/// collides; the back-end then rejects the upload deterministically.
pub(crate) fn gen_unique_filename(entries: &[String], filename: &str) -> String {
    let mut unique = filename.to_owned();
    let (stem, ext) = split_filename(filename);
    let mut i = 1;
    while entries.iter().any(|e| e == &unique) && i <= 16 {
        unique = match ext {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };
        i += 1;
    }
    unique
}

/// Splits at the last dot; the extension excludes the dot.
fn split_filename(filename: &str) -> (&str, Option<&str>) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (filename, None),
    }
}
