//! Camera client: snapshot fetch and reachability probe over HTTP.
//!
//! Embedded camera web servers are flaky about keep-alive, so every attempt
//! uses a fresh client without an idle pool and sends `Connection: close`.
//! Transport failures are normalised into [`CameraError`]; callers never see
//! raw transport error text.

use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONNECTION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode, Url};
use tracing::{debug, warn};

use lapse_common::config::{AuthMode, Config};
use lapse_common::protocol::CameraErrorInfo;

use crate::digest;

/// Pause between two attempts of the same fetch.
const RETRY_DELAY: Duration = Duration::from_millis(350);

/// Bytes read from the GET fallback of a health probe.
const PROBE_CHUNK: usize = 1024;

/// Normalised camera failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CameraError {
    #[error("Camera did not respond in time")]
    Timeout,
    #[error("Connection to camera was dropped")]
    ConnectionDropped,
    #[error("Camera refused the connection")]
    ConnectionRefused,
    #[error("Camera rejected the credentials")]
    AuthFailed,
    #[error("Camera answered with HTTP {0}")]
    Http(u16),
    #[error("No camera URL configured")]
    NoUrl,
    #[error("Camera returned an empty image")]
    EmptyImage,
    #[error("Unexpected camera error")]
    Unknown,
}

impl CameraError {
    pub fn code(&self) -> String {
        match self {
            Self::Timeout => "timeout".into(),
            Self::ConnectionDropped => "connection_dropped".into(),
            Self::ConnectionRefused => "connection_refused".into(),
            Self::AuthFailed => "auth_failed".into(),
            Self::Http(status) => format!("http_error:{status}"),
            Self::NoUrl => "no_url".into(),
            Self::EmptyImage => "empty_image".into(),
            Self::Unknown => "unknown".into(),
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionDropped | Self::ConnectionRefused => true,
            Self::Http(status) => *status >= 500,
            _ => false,
        }
    }

    pub fn info(&self) -> CameraErrorInfo {
        CameraErrorInfo {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Something that can deliver still images.
pub trait Camera: Send + Sync {
    /// Fetch one image, retrying transient failures within the budget.
    fn fetch(&self, cfg: &Config) -> Result<Vec<u8>, CameraError>;

    /// Lightweight reachability check.
    fn probe(&self, cfg: &Config) -> Result<(), CameraError>;
}

/// [`Camera`] backed by a blocking `reqwest` client.
pub struct HttpCamera {
    retry_delay: Duration,
}

impl Default for HttpCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCamera {
    pub fn new() -> Self {
        HttpCamera {
            retry_delay: RETRY_DELAY,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_retry_delay(retry_delay: Duration) -> Self {
        HttpCamera { retry_delay }
    }

    /// Run `op` up to `budget` times while it fails with a retryable error.
    fn with_retries<T>(
        &self,
        budget: u32,
        what: &str,
        mut op: impl FnMut() -> Result<T, CameraError>,
    ) -> Result<T, CameraError> {
        let attempts = budget.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!("{what} attempt {attempt}/{attempts} failed: {}", e.code());
                    attempt += 1;
                    std::thread::sleep(self.retry_delay);
                }
                Err(e) => {
                    if attempt > 1 {
                        warn!("{what} failed after {attempt} attempts: {}", e.code());
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One request, answering a digest challenge if the camera sends one.
    fn send(&self, cfg: &Config, method: Method, timeout: Duration) -> Result<Response, CameraError> {
        let client = build_client(timeout)?;
        let resp = request(&client, cfg, method.clone())
            .send()
            .map_err(|e| classify(&e))?;

        let resp = match (resp.status(), cfg.auth_mode, cfg.credentials()) {
            (StatusCode::UNAUTHORIZED, AuthMode::Digest, Some((user, pass))) => {
                let challenge = resp
                    .headers()
                    .get_all(WWW_AUTHENTICATE)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .find_map(digest::parse_challenge);
                match challenge {
                    Some(ch) => {
                        let uri = request_uri(resp.url());
                        let header = digest::authorization(&ch, user, pass, method.as_str(), &uri);
                        drop(resp);
                        request(&client, cfg, method)
                            .header(AUTHORIZATION, header)
                            .send()
                            .map_err(|e| classify(&e))?
                    }
                    None => resp,
                }
            }
            _ => resp,
        };

        check_status(resp)
    }
}

impl Camera for HttpCamera {
    fn fetch(&self, cfg: &Config) -> Result<Vec<u8>, CameraError> {
        if cfg.cam_url.trim().is_empty() {
            return Err(CameraError::NoUrl);
        }
        let timeout = Duration::from_secs(cfg.snapshot_timeout_secs.max(1));

        self.with_retries(cfg.camera_retries, "snapshot", || {
            let resp = self.send(cfg, Method::GET, timeout)?;
            let bytes = resp.bytes().map_err(|e| classify(&e))?;
            if bytes.is_empty() {
                return Err(CameraError::EmptyImage);
            }
            Ok(bytes.to_vec())
        })
    }

    fn probe(&self, cfg: &Config) -> Result<(), CameraError> {
        if cfg.cam_url.trim().is_empty() {
            return Err(CameraError::NoUrl);
        }
        let timeout = Duration::from_secs(cfg.health_timeout_secs.max(1));

        match self.send(cfg, Method::HEAD, timeout) {
            Ok(_) => return Ok(()),
            Err(e) => debug!("HEAD probe failed ({}), trying GET", e.code()),
        }

        self.with_retries(cfg.camera_retries, "health probe", || {
            let mut resp = self.send(cfg, Method::GET, timeout)?;
            let mut buf = [0u8; PROBE_CHUNK];
            resp.read(&mut buf).map_err(|e| classify_io(&e))?;
            Ok(())
        })
    }
}

fn build_client(timeout: Duration) -> Result<Client, CameraError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .pool_max_idle_per_host(0)
        .build()
        .map_err(|e| {
            warn!("Cannot build camera HTTP client: {e}");
            CameraError::Unknown
        })
}

fn request(client: &Client, cfg: &Config, method: Method) -> RequestBuilder {
    let builder = client
        .request(method, cfg.cam_url.as_str())
        .header(CONNECTION, "close");
    match (cfg.auth_mode, cfg.credentials()) {
        (AuthMode::Basic, Some((user, pass))) => builder.basic_auth(user, Some(pass)),
        _ => builder,
    }
}

fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    }
}

fn check_status(resp: Response) -> Result<Response, CameraError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(CameraError::AuthFailed);
    }
    if !status.is_success() {
        return Err(CameraError::Http(status.as_u16()));
    }
    Ok(resp)
}

/// Map a transport error onto the closed error set.
fn classify(e: &reqwest::Error) -> CameraError {
    debug!("Camera transport error: {e:?}");
    if e.is_timeout() {
        return CameraError::Timeout;
    }
    if e.is_connect() {
        return match io_kind(e) {
            Some(std::io::ErrorKind::TimedOut) => CameraError::Timeout,
            Some(std::io::ErrorKind::ConnectionReset) => CameraError::ConnectionDropped,
            _ => CameraError::ConnectionRefused,
        };
    }
    if e.is_request() || e.is_body() || e.is_decode() {
        return CameraError::ConnectionDropped;
    }
    match io_kind(e) {
        Some(kind) => classify_kind(kind),
        None => CameraError::Unknown,
    }
}

fn classify_io(e: &std::io::Error) -> CameraError {
    debug!("Camera read error: {e:?}");
    classify_kind(e.kind())
}

fn classify_kind(kind: std::io::ErrorKind) -> CameraError {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => CameraError::Timeout,
        ErrorKind::ConnectionRefused => CameraError::ConnectionRefused,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => CameraError::ConnectionDropped,
        _ => CameraError::Unknown,
    }
}

/// First `io::Error` kind in the source chain.
fn io_kind(e: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = std::error::Error::source(err);
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Read the request head so the client sees a clean response/close.
    fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(1) => head.push(byte[0]),
                _ => break,
            }
        }
        String::from_utf8_lossy(&head).to_string()
    }

    /// Serve canned responses in order (the last one repeats).  Returns the
    /// base URL, the accepted-connection counter and captured request heads.
    /// Serves `responses` in order (the last one repeats); `None` drops
    /// the connection.
    pub(crate) fn stub(responses: Vec<Option<String>>) -> (String, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let heads = Arc::new(Mutex::new(Vec::new()));
        let (h, r) = (hits.clone(), heads.clone());
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let n = h.fetch_add(1, Ordering::SeqCst);
                let head = read_head(&mut stream);
                r.lock().unwrap().push(head);
                let idx = n.min(responses.len() - 1);
                if let Some(resp) = &responses[idx] {
                    let _ = stream.write_all(resp.as_bytes());
                }
                // `None` drops the connection without answering.
            }
        });
        (format!("http://{addr}/snapshot.jpg"), hits, heads)
    }

    fn reply(status: &str, headers: &str, body: &str) -> Option<String> {
        Some(format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n{headers}\r\n{body}",
            body.len()
        ))
    }

    fn cfg(url: &str) -> Config {
        Config {
            cam_url: url.to_string(),
            snapshot_timeout_secs: 2,
            health_timeout_secs: 2,
            camera_retries: 3,
            ..Config::default()
        }
    }

    fn camera() -> HttpCamera {
        HttpCamera::with_retry_delay(Duration::from_millis(10))
    }

    #[test]
    fn test_error_codes_and_retry_policy() {
        assert_eq!(CameraError::Http(503).code(), "http_error:503");
        assert!(CameraError::Http(503).is_retryable());
        assert!(!CameraError::Http(404).is_retryable());
        assert!(!CameraError::AuthFailed.is_retryable());
        assert!(!CameraError::EmptyImage.is_retryable());
        assert!(CameraError::ConnectionDropped.is_retryable());
        assert_eq!(CameraError::Timeout.info().code, "timeout");
    }

    #[test]
    fn test_fetch_success_sends_connection_close() {
        let (url, hits, heads) = stub(vec![reply("200 OK", "Content-Type: image/jpeg\r\n", "JPEGDATA")]);
        let bytes = camera().fetch(&cfg(&url)).unwrap();
        assert_eq!(bytes, b"JPEGDATA");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let head = heads.lock().unwrap()[0].to_lowercase();
        assert!(head.contains("connection: close"), "{head}");
    }

    #[test]
    fn test_dropped_connection_uses_full_budget() {
        let (url, hits, _) = stub(vec![None]);
        let err = camera().fetch(&cfg(&url)).unwrap_err();
        assert_eq!(err, CameraError::ConnectionDropped);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let info = err.info();
        assert_eq!(info.code, "connection_dropped");
        assert_eq!(info.message, "Connection to camera was dropped");
        assert!(!info.message.contains("hyper"));
        assert!(!info.message.contains("error sending request"));
    }

    #[test]
    fn test_server_error_retried_then_success() {
        let (url, hits, _) = stub(vec![
            reply("503 Service Unavailable", "", ""),
            reply("200 OK", "", "IMG"),
        ]);
        assert_eq!(camera().fetch(&cfg(&url)).unwrap(), b"IMG");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_auth_and_client_errors_not_retried() {
        let (url, hits, _) = stub(vec![reply("401 Unauthorized", "", "")]);
        assert_eq!(camera().fetch(&cfg(&url)).unwrap_err(), CameraError::AuthFailed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let (url, hits, _) = stub(vec![reply("404 Not Found", "", "")]);
        assert_eq!(camera().fetch(&cfg(&url)).unwrap_err(), CameraError::Http(404));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_body_is_error() {
        let (url, hits, _) = stub(vec![reply("200 OK", "", "")]);
        assert_eq!(camera().fetch(&cfg(&url)).unwrap_err(), CameraError::EmptyImage);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refused_and_missing_url() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = camera().fetch(&cfg(&format!("http://{addr}/x.jpg"))).unwrap_err();
        assert_eq!(err, CameraError::ConnectionRefused);

        assert_eq!(camera().fetch(&cfg("")).unwrap_err(), CameraError::NoUrl);
        assert_eq!(camera().probe(&cfg(" ")).unwrap_err(), CameraError::NoUrl);
    }

    #[test]
    fn test_basic_auth_header() {
        let (url, _, heads) = stub(vec![reply("200 OK", "", "IMG")]);
        let cfg = Config {
            auth_mode: AuthMode::Basic,
            username: Some("admin".into()),
            password: Some("secret".into()),
            ..cfg(&url)
        };
        camera().fetch(&cfg).unwrap();
        let head = heads.lock().unwrap()[0].to_lowercase();
        // base64("admin:secret")
        assert!(head.contains("authorization: basic ywrtaw46c2vjcmv0"), "{head}");
    }

    #[test]
    fn test_digest_challenge_answered() {
        let (url, hits, heads) = stub(vec![
            reply(
                "401 Unauthorized",
                "WWW-Authenticate: Digest realm=\"cam\", nonce=\"n0nce\", qop=\"auth\"\r\n",
                "",
            ),
            reply("200 OK", "", "IMG"),
        ]);
        let cfg = Config {
            auth_mode: AuthMode::Digest,
            username: Some("admin".into()),
            password: Some("secret".into()),
            ..cfg(&url)
        };
        assert_eq!(camera().fetch(&cfg).unwrap(), b"IMG");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let second = heads.lock().unwrap()[1].clone();
        assert!(second.contains("Digest username=\"admin\""), "{second}");
        assert!(second.contains("uri=\"/snapshot.jpg\""), "{second}");
    }

    #[test]
    fn test_probe_falls_back_to_get() {
        let (url, hits, heads) = stub(vec![
            reply("405 Method Not Allowed", "", ""),
            reply("200 OK", "", "IMG"),
        ]);
        camera().probe(&cfg(&url)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let heads = heads.lock().unwrap();
        assert!(heads[0].starts_with("HEAD "));
        assert!(heads[1].starts_with("GET "));
    }
}
