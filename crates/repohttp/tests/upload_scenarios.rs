//! Black-box tests driving the upload service over in-memory HTTP
//! requests with a mock repository back-end.

use std::convert::Infallible;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::{Request, StatusCode, header};
use tokio_stream::wrappers::UnboundedReceiverStream;

use repohttp::{
    AccessInfo, HttpResponse, RepoError, RepoResult, Repository, UploadConfig, UploadService,
    UploadServiceBuilder,
};

const SIMPLE_BODY: &[u8] = b"--X\r\n\
    Content-Disposition: form-data; name=\"parent_dir\"\r\n\
    \r\n\
    /docs\r\n\
    --X\r\n\
    Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
    \r\n\
    hello\r\n\
    --X--\r\n";

const UPDATE_BODY: &[u8] = b"--X\r\n\
    Content-Disposition: form-data; name=\"target_file\"\r\n\
    \r\n\
    /x/y.txt\r\n\
    --X\r\n\
    Content-Disposition: form-data; name=\"file\"; filename=\"y.txt\"\r\n\
    \r\n\
    new contents\r\n\
    --X--\r\n";

#[derive(Debug, Clone)]
struct RecordedCall {
    op: &'static str,
    parent_dir: String,
    name: String,
    user: String,
    content: Vec<u8>,
}

#[derive(Default)]
struct MockRepo {
    /// Existing entry names returned for any directory listing.
    entries: Vec<String>,
    quota_exceeded: bool,
    post_error: Option<String>,
    put_error: Option<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockRepo {
    fn record(&self, op: &'static str, src: &Path, parent_dir: &str, name: &str, user: &str) {
        let content = fs::read(src).expect("temp file must exist during the back-end call");
        self.calls.lock().unwrap().push(RecordedCall {
            op,
            parent_dir: parent_dir.to_owned(),
            name: name.to_owned(),
            user: user.to_owned(),
            content,
        });
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Repository for MockRepo {
    async fn check_access_token(&self, token: &str) -> RepoResult<AccessInfo> {
        if token == "tok-1" {
            Ok(AccessInfo {
                repo_id: "repo-1".to_owned(),
                user: "alice@example.com".to_owned(),
            })
        } else {
            Err(RepoError::new("token not found"))
        }
    }

    async fn check_quota(&self, _repo_id: &str) -> RepoResult<()> {
        if self.quota_exceeded {
            Err(RepoError::new("quota exceeded"))
        } else {
            Ok(())
        }
    }

    async fn list_dir(&self, _repo_id: &str, _parent_dir: &str) -> RepoResult<Vec<String>> {
        Ok(self.entries.clone())
    }

    async fn post_file(
        &self,
        _repo_id: &str,
        src: &Path,
        parent_dir: &str,
        name: &str,
        user: &str,
    ) -> RepoResult<()> {
        self.record("post", src, parent_dir, name, user);
        match &self.post_error {
            Some(msg) => Err(RepoError::new(msg.clone())),
            None => Ok(()),
        }
    }

    async fn put_file(
        &self,
        _repo_id: &str,
        src: &Path,
        parent_dir: &str,
        name: &str,
        user: &str,
    ) -> RepoResult<()> {
        self.record("put", src, parent_dir, name, user);
        match &self.put_error {
            Some(msg) => Err(RepoError::new(msg.clone())),
            None => Ok(()),
        }
    }
}

struct TestSetup {
    service: UploadService,
    repo: Arc<MockRepo>,
    temp_dir: tempfile::TempDir,
}

fn setup(repo: MockRepo) -> TestSetup {
    setup_with_limit(repo, 100 * 1024 * 1024)
}

fn setup_with_limit(repo: MockRepo, max_upload_file_size: u64) -> TestSetup {
    let repo = Arc::new(repo);
    let temp_dir = tempfile::tempdir().unwrap();
    let mut builder = UploadServiceBuilder::new(Arc::clone(&repo));
    builder.set_config(
        UploadConfig::new()
            .with_service_url("http://hub")
            .with_temp_dir(temp_dir.path())
            .with_max_upload_file_size(max_upload_file_size),
    );
    let service = builder.build().unwrap();
    TestSetup {
        service,
        repo,
        temp_dir,
    }
}

fn post_request(route: &str, progress_id: &str, body: &[u8]) -> Request<Full<Bytes>> {
    Request::builder()
        .method("POST")
        .uri(format!("{route}?X-Progress-ID={progress_id}"))
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=X")
        .header(header::CONTENT_LENGTH, body.len().to_string())
        .body(Full::new(Bytes::copy_from_slice(body)))
        .unwrap()
}

fn progress_request(progress_id: &str, callback: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method("GET")
        .uri(format!(
            "/upload_progress?X-Progress-ID={progress_id}&callback={callback}"
        ))
        .body(Full::default())
        .unwrap()
}

fn location(resp: &HttpResponse) -> &str {
    resp.headers()[header::LOCATION].to_str().unwrap()
}

async fn body_string(resp: HttpResponse) -> String {
    let collected = resp.into_body().collect().await.unwrap();
    String::from_utf8(collected.to_bytes().to_vec()).unwrap()
}

fn temp_dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).unwrap().next().is_none()
}

#[tokio::test]
async fn simple_upload_round_trip() {
    let t = setup(MockRepo::default());

    let resp = t
        .service
        .call(post_request("/upload/tok-1", "pg-simple", SIMPLE_BODY))
        .await;

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(location(&resp), "http://hub/repo/repo-1?p=%2Fdocs");

    let calls = t.repo.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].op, "post");
    assert_eq!(calls[0].parent_dir, "/docs");
    assert_eq!(calls[0].name, "a.txt");
    assert_eq!(calls[0].user, "alice@example.com");
    assert_eq!(calls[0].content, b"hello");

    // Everything is released once the request finished.
    assert!(temp_dir_is_empty(t.temp_dir.path()));
    assert!(repohttp::progress::registry().lookup("pg-simple").is_none());
}

#[tokio::test]
async fn chunked_delivery_matches_single_shot() {
    let t = setup(MockRepo::default());

    let frames: Vec<Result<Frame<Bytes>, Infallible>> = SIMPLE_BODY
        .chunks(1)
        .map(|c| Ok(Frame::data(Bytes::copy_from_slice(c))))
        .collect();
    let body = StreamBody::new(futures::stream::iter(frames));

    let req = Request::builder()
        .method("POST")
        .uri("/upload/tok-1?X-Progress-ID=pg-chunked")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=X")
        .header(header::CONTENT_LENGTH, SIMPLE_BODY.len().to_string())
        .body(body)
        .unwrap();

    let resp = t.service.call(req).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(location(&resp), "http://hub/repo/repo-1?p=%2Fdocs");

    let calls = t.repo.calls();
    assert_eq!(calls[0].content, b"hello");
}

#[tokio::test]
async fn name_collision_picks_next_free_candidate() {
    let t = setup(MockRepo {
        entries: vec!["a.txt".to_owned(), "a (1).txt".to_owned()],
        ..MockRepo::default()
    });

    let resp = t
        .service
        .call(post_request("/upload/tok-1", "pg-collision", SIMPLE_BODY))
        .await;

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(t.repo.calls()[0].name, "a (2).txt");
}

#[tokio::test]
async fn exhausted_candidates_surface_exists_error() {
    let mut entries = vec!["a.txt".to_owned()];
    for i in 1..=16 {
        entries.push(format!("a ({i}).txt"));
    }
    let t = setup(MockRepo {
        entries,
        post_error: Some("file already exists".to_owned()),
        ..MockRepo::default()
    });

    let resp = t
        .service
        .call(post_request("/upload/tok-1", "pg-exhausted", SIMPLE_BODY))
        .await;

    // The 16th candidate is submitted even though it collides; the
    // back-end rejects it and the client sees the exists error code.
    assert_eq!(t.repo.calls()[0].name, "a (16).txt");
    assert_eq!(
        location(&resp),
        "http://hub/repo/upload_error/repo-1?p=%2Fdocs&fn=a.txt&err=1"
    );
}

#[tokio::test]
async fn oversize_upload_is_rejected_after_receipt() {
    let t = setup_with_limit(MockRepo::default(), 4);

    let resp = t
        .service
        .call(post_request("/upload/tok-1", "pg-oversize", SIMPLE_BODY))
        .await;

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        location(&resp),
        "http://hub/repo/upload_error/repo-1?p=%2Fdocs&fn=a.txt&err=3"
    );
    // No back-end call is made and the temp file is gone.
    assert!(t.repo.calls().is_empty());
    assert!(temp_dir_is_empty(t.temp_dir.path()));
}

#[tokio::test]
async fn bad_boundary_closes_the_connection() {
    let t = setup(MockRepo::default());

    let body = b"this is not a boundary line\r\nmore\r\n";
    let resp = t
        .service
        .call(post_request("/upload/tok-1", "pg-badboundary", body))
        .await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        resp.headers().get(header::CONNECTION).map(|v| v.as_bytes()),
        Some(b"close".as_ref())
    );
    assert!(t.repo.calls().is_empty());
    assert!(temp_dir_is_empty(t.temp_dir.path()));
    assert!(
        repohttp::progress::registry()
            .lookup("pg-badboundary")
            .is_none()
    );
}

#[tokio::test]
async fn progress_is_visible_during_the_upload() {
    let t = setup(MockRepo::default());

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Frame<Bytes>, Infallible>>();
    let body = StreamBody::new(UnboundedReceiverStream::new(rx));

    let req = Request::builder()
        .method("POST")
        .uri("/upload/tok-1?X-Progress-ID=pg-live")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=X")
        .header(header::CONTENT_LENGTH, SIMPLE_BODY.len().to_string())
        .body(body)
        .unwrap();

    let service = t.service.clone();
    let upload = tokio::spawn(async move { service.call(req).await });

    let (head, tail) = SIMPLE_BODY.split_at(40);
    tx.send(Ok(Frame::data(Bytes::copy_from_slice(head))))
        .unwrap();

    // Poll until the service has consumed the first chunk.
    let mut uploaded = 0;
    for _ in 0..200 {
        let resp = t.service.call(progress_request("pg-live", "cb")).await;
        if resp.status() == StatusCode::OK {
            let body = body_string(resp).await;
            assert!(body.starts_with("cb("), "unexpected JSONP body: {body}");
            assert!(body.ends_with(");"), "unexpected JSONP body: {body}");
            let json: serde_json::Value =
                serde_json::from_str(&body[3..body.len() - 2]).unwrap();
            uploaded = json["uploaded"].as_i64().unwrap();
            let length = json["length"].as_i64().unwrap();
            assert_eq!(length, SIMPLE_BODY.len() as i64);
            assert!(uploaded <= length);
            if uploaded > 0 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(uploaded, 40);

    tx.send(Ok(Frame::data(Bytes::copy_from_slice(tail))))
        .unwrap();
    drop(tx);

    let resp = upload.await.unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(t.repo.calls()[0].content, b"hello");

    // The entry is gone after the request finished.
    let resp = t.service.call(progress_request("pg-live", "cb")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn progress_query_requires_known_id_and_callback() {
    let t = setup(MockRepo::default());

    let resp = t.service.call(progress_request("pg-unknown", "cb")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = Request::builder()
        .method("GET")
        .uri("/upload_progress?X-Progress-ID=pg-unknown")
        .body(Full::<Bytes>::default())
        .unwrap();
    let resp = t.service.call(req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_replaces_target_file() {
    let t = setup(MockRepo::default());

    let resp = t
        .service
        .call(post_request("/update/tok-1", "pg-update", UPDATE_BODY))
        .await;

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(location(&resp), "http://hub/repo/repo-1?p=%2Fx");

    let calls = t.repo.calls();
    assert_eq!(calls[0].op, "put");
    assert_eq!(calls[0].parent_dir, "/x");
    assert_eq!(calls[0].name, "y.txt");
    assert_eq!(calls[0].content, b"new contents");
}

#[tokio::test]
async fn update_of_missing_file_redirects_with_not_exist() {
    let t = setup(MockRepo {
        put_error: Some("file does not exist".to_owned()),
        ..MockRepo::default()
    });

    let resp = t
        .service
        .call(post_request("/update/tok-1", "pg-missing", UPDATE_BODY))
        .await;

    assert_eq!(
        location(&resp),
        "http://hub/repo/update_error/repo-1?p=%2Fx%2Fy.txt&err=2"
    );
}

#[tokio::test]
async fn body_without_file_part_is_a_receive_error() {
    let t = setup(MockRepo::default());

    let body = b"--X\r\n\
        Content-Disposition: form-data; name=\"parent_dir\"\r\n\
        \r\n\
        /docs\r\n\
        --X--\r\n";
    let resp = t
        .service
        .call(post_request("/upload/tok-1", "pg-nofile", body))
        .await;

    assert_eq!(
        location(&resp),
        "http://hub/repo/upload_error/repo-1?p=%2Fdocs&fn=&err=5"
    );
    assert!(t.repo.calls().is_empty());
}

#[tokio::test]
async fn missing_parent_dir_is_a_bad_request() {
    let t = setup(MockRepo::default());

    let body = b"--X\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
        \r\n\
        hello\r\n\
        --X--\r\n";
    let resp = t
        .service
        .call(post_request("/upload/tok-1", "pg-noparent", body))
        .await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(resp).await, "Invalid URL.\n");
    assert!(temp_dir_is_empty(t.temp_dir.path()));
}

#[tokio::test]
async fn quota_exceeded_redirects_with_quota_code() {
    let t = setup(MockRepo {
        quota_exceeded: true,
        ..MockRepo::default()
    });

    let resp = t
        .service
        .call(post_request("/upload/tok-1", "pg-quota", SIMPLE_BODY))
        .await;

    assert_eq!(
        location(&resp),
        "http://hub/repo/upload_error/repo-1?p=%2Fdocs&fn=a.txt&err=4"
    );
}

#[tokio::test]
async fn unknown_token_is_denied_before_the_body() {
    let t = setup(MockRepo::default());

    let resp = t
        .service
        .call(post_request("/upload/nope", "pg-denied", SIMPLE_BODY))
        .await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        resp.headers().get(header::CONNECTION).map(|v| v.as_bytes()),
        Some(b"close".as_ref())
    );
    assert_eq!(body_string(resp).await, "Access denied\n");
    assert!(repohttp::progress::registry().lookup("pg-denied").is_none());
}

#[tokio::test]
async fn missing_progress_id_is_rejected() {
    let t = setup(MockRepo::default());

    let req = Request::builder()
        .method("POST")
        .uri("/upload/tok-1")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=X")
        .header(header::CONTENT_LENGTH, SIMPLE_BODY.len().to_string())
        .body(Full::new(Bytes::copy_from_slice(SIMPLE_BODY)))
        .unwrap();
    let resp = t.service.call(req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unrouted_requests_get_not_found() {
    let t = setup(MockRepo::default());

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Full::<Bytes>::default())
        .unwrap();
    let resp = t.service.call(req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
