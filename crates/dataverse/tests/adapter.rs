//! Adapter tests against an in-process HTTP responder
//!
//! The responder serves canned JSON per method and path and records every
//! request so tests can assert on what reached the wire.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use dvu_core::{Error, RepositoryAdapter, Resource, RetryConfig, UploaderConfig};
use dvu_dataverse::DataverseAdapter;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PID: &str = "doi:10.5072/FK2/TEST";
const DATASET: &str = "/api/datasets/:persistentId/";
const FILES: &str = "/api/datasets/:persistentId/versions/:latest/files";
const LOCKS: &str = "/api/datasets/:persistentId/locks";
const ADD: &str = "/api/datasets/:persistentId/add";
const UPLOAD_URLS: &str = "/api/datasets/:persistentId/uploadurls";
const ADD_FILES: &str = "/api/datasets/:persistentId/addFiles";

#[derive(Clone)]
struct Route {
    method: &'static str,
    path: String,
    status: u16,
    body: String,
}

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    head: String,
    body: Vec<u8>,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<String> {
        header_value(&self.head, name)
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

struct TestServer {
    addr: SocketAddr,
    routes: Arc<Mutex<Vec<Route>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Arc<Mutex<Vec<Route>>> = Arc::default();
        let requests: Arc<Mutex<Vec<Recorded>>> = Arc::default();

        let (r, q) = (routes.clone(), requests.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream, r.clone(), q.clone()));
            }
        });

        Self {
            addr,
            routes,
            requests,
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn route(&self, method: &'static str, path: &str, status: u16, body: serde_json::Value) {
        self.routes.lock().unwrap().push(Route {
            method,
            path: path.to_string(),
            status,
            body: body.to_string(),
        });
    }

    /// Dataset, empty lock list and the given file listing
    fn dataset(&self, files: serde_json::Value) {
        self.route(
            "GET",
            DATASET,
            200,
            serde_json::json!({"status": "OK", "data": {"id": 17, "latestVersion": {"versionState": "DRAFT"}}}),
        );
        self.route("GET", FILES, 200, serde_json::json!({"status": "OK", "data": files}));
        self.route("GET", LOCKS, 200, serde_json::json!({"status": "OK", "data": []}));
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    fn count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

async fn handle(
    mut stream: TcpStream,
    routes: Arc<Mutex<Vec<Route>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
) {
    let Ok(request) = read_request(&mut stream).await else {
        return;
    };

    let route = routes
        .lock()
        .unwrap()
        .iter()
        .find(|r| r.method == request.method && r.path == request.path)
        .cloned();
    requests.lock().unwrap().push(request);

    let (status, body) = match route {
        Some(route) => (route.status, route.body),
        None => (404, r#"{"status":"ERROR","message":"no route"}"#.to_string()),
    };
    let response = format!(
        "HTTP/1.1 {status} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<Recorded> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut body = buf[head_end..].to_vec();

    let content_length = header_value(&head, "content-length").and_then(|v| v.parse::<usize>().ok());
    let chunked = header_value(&head, "transfer-encoding").is_some_and(|v| v.contains("chunked"));
    loop {
        let complete = match content_length {
            Some(len) => body.len() >= len,
            None if chunked => find(&body, b"0\r\n\r\n").is_some(),
            None => true,
        };
        if complete {
            break;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or_default().to_string();

    Ok(Recorded {
        method,
        path,
        head,
        body,
    })
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn config(server: &TestServer) -> UploaderConfig {
    let mut config = UploaderConfig {
        server_url: server.url(),
        api_key: "secret-token".into(),
        dataset_pid: PID.into(),
        http_retry: RetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        lock_poll_interval_ms: 50,
        max_wait_lock_secs: 1,
        ..Default::default()
    };
    config.validate().unwrap();
    config
}

/// `data/survey.csv` and `data/notes.txt` under a temp root
fn local_files() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("data")).unwrap();
    std::fs::write(dir.path().join("data/survey.csv"), b"a,b\n1,2\n").unwrap();
    std::fs::write(dir.path().join("data/notes.txt"), b"hello world").unwrap();
    dir
}

#[tokio::test]
async fn test_prepare_loads_catalog() {
    let server = TestServer::start().await;
    server.dataset(serde_json::json!([
        {"label": "survey.tab", "directoryLabel": "data",
         "dataFile": {"id": 101, "checksum": {"type": "MD5", "value": "0000"}}},
        {"label": "notes.txt", "directoryLabel": "data",
         "dataFile": {"id": 102, "checksum": {"type": "MD5", "value": "5EB63BBBE01EEED093CB22BB8F5ACDC3"}}}
    ]));
    let dir = local_files();

    let mut adapter = DataverseAdapter::new(&config(&server)).unwrap();
    adapter.prepare().await.unwrap();
    assert_eq!(adapter.catalog().len(), 2);

    let survey = Resource::new(dir.path().join("data/survey.csv")).unwrap();
    let notes = Resource::new(dir.path().join("data/notes.txt")).unwrap();

    // survey.csv was ingested as survey.tab
    assert_eq!(
        adapter.existing_id(&survey, "/data").await.unwrap().as_deref(),
        Some("101")
    );
    assert_eq!(
        adapter.existing_id(&notes, "/data").await.unwrap().as_deref(),
        Some("102")
    );
    assert_eq!(adapter.existing_id(&notes, "/other").await.unwrap(), None);

    assert!(adapter.verify_checksum(&notes, "102").await.unwrap());
    assert!(!adapter.verify_checksum(&survey, "101").await.unwrap());
    assert!(!adapter.verify_checksum(&notes, "999").await.unwrap());

    let requests = server.requests();
    assert!(requests.iter().all(|r| r.header("x-dataverse-key").as_deref() == Some("secret-token")));
}

#[tokio::test]
async fn test_checksum_lookup_finds_renamed_file() {
    let server = TestServer::start().await;
    server.dataset(serde_json::json!([
        {"label": "renamed.txt",
         "dataFile": {"id": 7, "checksum": {"type": "MD5", "value": "5eb63bbbe01eeed093cb22bb8f5acdc3"}}}
    ]));
    let dir = local_files();
    let notes = Resource::new(dir.path().join("data/notes.txt")).unwrap();

    let mut config = config(&server);
    let mut adapter = DataverseAdapter::new(&config).unwrap();
    adapter.prepare().await.unwrap();
    assert_eq!(adapter.existing_id(&notes, "/data").await.unwrap(), None);

    config.verify_checksums = true;
    let mut adapter = DataverseAdapter::new(&config).unwrap();
    adapter.prepare().await.unwrap();
    assert_eq!(
        adapter.existing_id(&notes, "/data").await.unwrap().as_deref(),
        Some("7")
    );
}

#[tokio::test]
async fn test_exact_path_wins_over_checksum() {
    let server = TestServer::start().await;
    server.dataset(serde_json::json!([
        {"label": "notes.txt", "directoryLabel": "data",
         "dataFile": {"id": 1, "checksum": {"type": "MD5", "value": "ffffffffffffffffffffffffffffffff"}}},
        {"label": "copy.txt", "directoryLabel": "elsewhere",
         "dataFile": {"id": 2, "checksum": {"type": "MD5", "value": "5eb63bbbe01eeed093cb22bb8f5acdc3"}}}
    ]));
    let dir = local_files();
    let notes = Resource::new(dir.path().join("data/notes.txt")).unwrap();

    let mut config = config(&server);
    config.verify_checksums = true;
    let mut adapter = DataverseAdapter::new(&config).unwrap();
    adapter.prepare().await.unwrap();

    assert_eq!(
        adapter.existing_id(&notes, "/data").await.unwrap().as_deref(),
        Some("1")
    );
    // Under another parent only the content matches.
    assert_eq!(
        adapter.existing_id(&notes, "/other").await.unwrap().as_deref(),
        Some("2")
    );
}

#[tokio::test]
async fn test_tabular_alias_requires_same_stem() {
    let server = TestServer::start().await;
    server.dataset(serde_json::json!([
        {"label": "survey_backup.tab", "directoryLabel": "data",
         "dataFile": {"id": 5, "checksum": {"type": "MD5", "value": "0000"}}}
    ]));
    let dir = local_files();
    let survey = Resource::new(dir.path().join("data/survey.csv")).unwrap();

    let mut adapter = DataverseAdapter::new(&config(&server)).unwrap();
    adapter.prepare().await.unwrap();

    assert_eq!(adapter.existing_id(&survey, "/data").await.unwrap(), None);
}

#[tokio::test]
async fn test_unauthorized_is_auth_error() {
    let server = TestServer::start().await;
    server.route(
        "GET",
        DATASET,
        401,
        serde_json::json!({"status": "ERROR", "message": "Bad api key"}),
    );

    let mut adapter = DataverseAdapter::new(&config(&server)).unwrap();
    let err = adapter.prepare().await.unwrap_err();

    assert!(matches!(&err, Error::Auth(message) if message == "Bad api key"));
    assert!(err.is_fatal());
    assert_eq!(server.count("GET", DATASET), 1);
}

#[tokio::test]
async fn test_missing_dataset_is_not_found() {
    let server = TestServer::start().await;

    let mut adapter = DataverseAdapter::new(&config(&server)).unwrap();
    let err = adapter.prepare().await.unwrap_err();

    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let server = TestServer::start().await;
    server.route(
        "GET",
        DATASET,
        500,
        serde_json::json!({"status": "ERROR", "message": "Internal error"}),
    );

    let mut adapter = DataverseAdapter::new(&config(&server)).unwrap();
    let err = adapter.prepare().await.unwrap_err();

    assert!(matches!(err, Error::Http { status: 500, .. }));
    assert_eq!(server.count("GET", DATASET), 1);
}

#[tokio::test]
async fn test_refused_connection_is_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = UploaderConfig {
        server_url: format!("http://{addr}"),
        api_key: "secret-token".into(),
        dataset_pid: PID.into(),
        http_retry: RetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..Default::default()
    };
    config.validate().unwrap();

    let mut adapter = DataverseAdapter::new(&config).unwrap();
    let err = adapter.prepare().await.unwrap_err();

    assert!(matches!(err, Error::Network(_)));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_dataset_stays_locked() {
    let server = TestServer::start().await;
    server.route(
        "GET",
        DATASET,
        200,
        serde_json::json!({"status": "OK", "data": {"id": 17}}),
    );
    server.route("GET", FILES, 200, serde_json::json!({"status": "OK", "data": []}));
    server.route(
        "GET",
        LOCKS,
        200,
        serde_json::json!({"status": "OK", "data": [{"lockType": "Ingest"}]}),
    );

    let mut adapter = DataverseAdapter::new(&config(&server)).unwrap();
    let err = adapter.prepare().await.unwrap_err();

    assert!(matches!(&err, Error::DatasetLocked(message) if message.contains("Ingest")));
    assert!(err.is_fatal());
    assert!(server.count("GET", LOCKS) > 1);
}

#[tokio::test]
async fn test_traditional_upload() {
    let server = TestServer::start().await;
    server.dataset(serde_json::json!([]));
    server.route(
        "POST",
        ADD,
        200,
        serde_json::json!({"status": "OK", "data": {"files": [{"dataFile": {"id": 555}}]}}),
    );
    let dir = local_files();
    let notes = Resource::new(dir.path().join("data/notes.txt")).unwrap();

    let config = UploaderConfig {
        direct_upload: false,
        no_ingest: true,
        ..config(&server)
    };
    let mut adapter = DataverseAdapter::new(&config).unwrap();
    adapter.prepare().await.unwrap();

    let id = adapter.upload(&notes, "/data").await.unwrap();
    assert_eq!(id.as_deref(), Some("555"));

    let requests = server.requests();
    let add = requests.iter().find(|r| r.path == ADD).unwrap();
    assert_eq!(add.header("x-dataverse-key").as_deref(), Some("secret-token"));
    assert!(add.header("content-type").unwrap().starts_with("multipart/form-data"));
    let body = add.body_text();
    assert!(body.contains("name=\"file\"; filename=\"notes.txt\""));
    assert!(body.contains("hello world"));
    assert!(body.contains("name=\"jsonData\""));
    assert!(body.contains(r#""directoryLabel":"data""#));
    assert!(body.contains(r#""tabIngest":false"#));
}

#[tokio::test]
async fn test_rejected_upload_is_soft_failure() {
    let server = TestServer::start().await;
    server.dataset(serde_json::json!([]));
    server.route(
        "POST",
        ADD,
        400,
        serde_json::json!({"status": "ERROR", "message": "Duplicate file"}),
    );
    let dir = local_files();
    let notes = Resource::new(dir.path().join("data/notes.txt")).unwrap();

    let config = UploaderConfig {
        direct_upload: false,
        ..config(&server)
    };
    let mut adapter = DataverseAdapter::new(&config).unwrap();
    adapter.prepare().await.unwrap();

    assert_eq!(adapter.upload(&notes, "/data").await.unwrap(), None);
    assert_eq!(server.count("POST", ADD), 1);
}

#[tokio::test]
async fn test_direct_upload_falls_back_when_unsupported() {
    let server = TestServer::start().await;
    server.dataset(serde_json::json!([]));
    server.route(
        "GET",
        UPLOAD_URLS,
        404,
        serde_json::json!({"status": "ERROR", "message": "Direct upload not supported"}),
    );
    server.route(
        "POST",
        ADD,
        200,
        serde_json::json!({"status": "OK", "data": {"files": [{"dataFile": {"id": 9}}]}}),
    );
    let dir = local_files();
    let notes = Resource::new(dir.path().join("data/notes.txt")).unwrap();

    let mut adapter = DataverseAdapter::new(&config(&server)).unwrap();
    adapter.prepare().await.unwrap();

    assert_eq!(adapter.upload(&notes, "/").await.unwrap().as_deref(), Some("9"));
    assert_eq!(server.count("GET", UPLOAD_URLS), 1);
    assert_eq!(server.count("POST", ADD), 1);
    assert_eq!(server.count("POST", ADD_FILES), 0);
}

#[tokio::test]
async fn test_direct_upload() {
    let server = TestServer::start().await;
    server.dataset(serde_json::json!([]));
    server.route(
        "GET",
        UPLOAD_URLS,
        200,
        serde_json::json!({"status": "OK", "data": {
            "url": format!("{}/storage/bucket/object-1?X-Amz-Signature=abc", server.url()),
            "storageIdentifier": "s3://bucket:object-1"
        }}),
    );
    server.route("PUT", "/storage/bucket/object-1", 200, serde_json::json!({}));
    server.route(
        "POST",
        ADD_FILES,
        200,
        serde_json::json!({"status": "OK", "data": {"Files": [{"dataFile": {"id": 31}}]}}),
    );
    let dir = local_files();
    let notes = Resource::new(dir.path().join("data/notes.txt")).unwrap();

    let mut adapter = DataverseAdapter::new(&config(&server)).unwrap();
    adapter.prepare().await.unwrap();

    assert_eq!(adapter.upload(&notes, "/data").await.unwrap().as_deref(), Some("31"));

    let requests = server.requests();
    let put = requests.iter().find(|r| r.method == "PUT").unwrap();
    assert_eq!(put.header("x-dataverse-key"), None);
    assert_eq!(
        put.header("content-type").as_deref(),
        Some("application/octet-stream")
    );
    assert_eq!(put.body, b"hello world");

    let register = requests.iter().find(|r| r.path == ADD_FILES).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&register.body).unwrap();
    let file = &json["files"][0];
    assert_eq!(file["storageIdentifier"], "s3://bucket:object-1");
    assert_eq!(file["fileName"], "notes.txt");
    assert_eq!(file["mimeType"], "text/plain");
    assert_eq!(file["directoryLabel"], "data");
    assert_eq!(file["checksum"]["@type"], "MD5");
    assert_eq!(file["checksum"]["@value"], "5eb63bbbe01eeed093cb22bb8f5acdc3");
}
