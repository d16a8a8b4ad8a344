//! Remote store transports.
//!
//! A transport uploads one named file and reports whether the remote side
//! now holds it. Re-uploading the same remote path must either overwrite or
//! be reported as [`UploadOutcome::AlreadyPresent`]; the delivery stage relies
//! on that for safe retries.

use crate::config::Config;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Header carrying the sensor identifier on HTTP uploads.
pub const SENSOR_ID_HEADER: &str = "X-Sensor-Id";

/// What the remote store did with an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The file was written (or overwritten)
    Stored,
    /// The remote already had this file and rejected the duplicate
    AlreadyPresent,
}

/// Uploads a local file to a remote path.
pub trait Transport: Send + Sync {
    fn upload(&self, local_path: &Path, remote_path: &str) -> Result<UploadOutcome, TransportError>;

    /// Short description for logs (never includes credentials).
    fn describe(&self) -> String;

    /// Cheap reachability check used at startup. Defaults to success.
    fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Transport error types.
#[derive(Debug)]
pub enum TransportError {
    /// Configuration error
    Config(String),
    /// Reading the local file or writing the remote one failed
    Io(String),
    /// Network/HTTP error
    Network(String),
    /// Remote store returned an error response
    Remote { status: u16, message: String },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Config(msg) => write!(f, "Transport config error: {msg}"),
            TransportError::Io(msg) => write!(f, "Transport IO error: {msg}"),
            TransportError::Network(msg) => write!(f, "Transport network error: {msg}"),
            TransportError::Remote { status, message } => {
                write!(f, "Remote store error ({status}): {message}")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Build the transport named by `remote_endpoint`.
pub fn from_config(config: &Config) -> Result<Box<dyn Transport>, TransportError> {
    let endpoint = config
        .remote_endpoint
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| TransportError::Config("remote_endpoint is not set".to_string()))?;

    if let Some(root) = endpoint.strip_prefix("file://") {
        return Ok(Box::new(DirectoryTransport::new(root)));
    }

    if endpoint.starts_with("sftp://") {
        let sftp_config = SftpTransportConfig::parse(endpoint, config.remote_credentials.clone())?
            .with_timeout(config.transport_timeout());
        return Ok(Box::new(SftpTransport::new(sftp_config)));
    }

    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        let http_config = HttpTransportConfig::new(
            endpoint,
            config.remote_credentials.clone(),
            config.sensor_id.clone(),
        )
        .with_timeout(config.transport_timeout());
        return Ok(Box::new(HttpTransport::new(http_config)?));
    }

    Err(TransportError::Config(format!(
        "unsupported remote_endpoint scheme: {endpoint}"
    )))
}

// ============================================================================
// HTTP
// ============================================================================

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Base URL, uploads go to `<endpoint>/<remote path>`
    pub endpoint: String,
    /// Bearer authentication token
    pub token: Option<String>,
    /// Sent as `X-Sensor-Id`
    pub sensor_id: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        sensor_id: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            sensor_id: sensor_id.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn base(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }

    /// Full URL for a remote path.
    pub fn url_for(&self, remote_path: &str) -> String {
        format!("{}/{}", self.base(), remote_path.trim_start_matches('/'))
    }

    /// Get the health check endpoint URL.
    pub fn health_url(&self) -> String {
        format!("{}/health", self.base())
    }
}

/// Async uploader for an HTTP remote store.
pub struct HttpUploader {
    config: HttpTransportConfig,
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        reqwest::Url::parse(&config.endpoint)
            .map_err(|e| TransportError::Config(format!("invalid endpoint {}: {e}", config.endpoint)))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Test connection to the remote store.
    pub async fn test_connection(&self) -> Result<bool, TransportError> {
        let response = self
            .client
            .get(self.config.health_url())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    /// PUT a file body to `remote_path`.
    pub async fn upload_bytes(
        &self,
        body: Vec<u8>,
        remote_path: &str,
    ) -> Result<UploadOutcome, TransportError> {
        let mut request = self
            .client
            .put(self.config.url_for(remote_path))
            .header("Content-Type", "application/json")
            .header(SENSOR_ID_HEADER, &self.config.sensor_id)
            .body(body);

        if let Some(ref token) = self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            return Ok(UploadOutcome::AlreadyPresent);
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransportError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        Ok(UploadOutcome::Stored)
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }
}

/// Blocking HTTP transport for use on the delivery thread.
pub struct HttpTransport {
    inner: HttpUploader,
    runtime: tokio::runtime::Runtime,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::Config(format!("Failed to create runtime: {e}")))?;

        Ok(Self {
            inner: HttpUploader::new(config)?,
            runtime,
        })
    }

    /// Test connection to the remote store.
    pub fn test_connection(&self) -> Result<bool, TransportError> {
        self.runtime.block_on(self.inner.test_connection())
    }
}

impl Transport for HttpTransport {
    fn upload(&self, local_path: &Path, remote_path: &str) -> Result<UploadOutcome, TransportError> {
        let body = std::fs::read(local_path)
            .map_err(|e| TransportError::Io(format!("{}: {e}", local_path.display())))?;
        debug!(remote_path, bytes = body.len(), "uploading over http");
        self.runtime
            .block_on(self.inner.upload_bytes(body, remote_path))
    }

    fn describe(&self) -> String {
        self.inner.config().endpoint.clone()
    }

    fn health_check(&self) -> Result<(), TransportError> {
        match self.test_connection()? {
            true => Ok(()),
            false => Err(TransportError::Network(format!(
                "health check failed at {}",
                self.inner.config().health_url()
            ))),
        }
    }
}

// ============================================================================
// SFTP
// ============================================================================

/// SFTP transport configuration, from `sftp://user@host[:port]/base/dir`.
#[derive(Debug, Clone)]
pub struct SftpTransportConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Password authentication
    pub password: Option<String>,
    /// Remote directory that remote paths are resolved against
    pub base_dir: String,
    /// Connect and per-operation timeout
    pub timeout: Duration,
}

impl SftpTransportConfig {
    pub fn parse(endpoint: &str, password: Option<String>) -> Result<Self, TransportError> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| TransportError::Config(format!("invalid endpoint {endpoint}: {e}")))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::Config(format!("no host in {endpoint}")))?;
        if url.username().is_empty() {
            return Err(TransportError::Config(format!(
                "no user in {endpoint}, expected sftp://user@host/dir"
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(22),
            username: url.username().to_string(),
            password,
            base_dir: url.path().to_string(),
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Absolute remote location of a remote path.
    pub fn remote_file(&self, remote_path: &str) -> PathBuf {
        let base = if self.base_dir.is_empty() { "/" } else { &self.base_dir };
        Path::new(base).join(remote_path.trim_start_matches('/'))
    }
}

/// Uploads over SFTP, one SSH session per file.
pub struct SftpTransport {
    config: SftpTransportConfig,
}

impl SftpTransport {
    pub fn new(config: SftpTransportConfig) -> Self {
        Self { config }
    }

    fn connect(&self) -> Result<ssh2::Session, TransportError> {
        let network = |e: &dyn std::fmt::Display| {
            TransportError::Network(format!("{}:{}: {e}", self.config.host, self.config.port))
        };

        let addr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| network(&e))?
            .next()
            .ok_or_else(|| network(&"no address"))?;
        let tcp = TcpStream::connect_timeout(&addr, self.config.timeout).map_err(|e| network(&e))?;

        let mut session = ssh2::Session::new().map_err(|e| network(&e))?;
        session.set_timeout(self.config.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| network(&e))?;

        let password = self.config.password.as_deref().unwrap_or_default();
        session
            .userauth_password(&self.config.username, password)
            .map_err(|e| TransportError::Remote {
                status: 401,
                message: format!("authentication failed for {}: {e}", self.config.username),
            })?;

        Ok(session)
    }
}

/// Create each missing directory along `dir`.
fn sftp_create_dirs(sftp: &ssh2::Sftp, dir: &Path) -> Result<(), TransportError> {
    let mut missing: Vec<&Path> = dir
        .ancestors()
        .take_while(|d| !d.as_os_str().is_empty() && sftp.stat(d).is_err())
        .collect();
    missing.reverse();

    for d in missing {
        sftp.mkdir(d, 0o755)
            .map_err(|e| TransportError::Io(format!("mkdir {}: {e}", d.display())))?;
    }
    Ok(())
}

impl Transport for SftpTransport {
    fn upload(&self, local_path: &Path, remote_path: &str) -> Result<UploadOutcome, TransportError> {
        let body = std::fs::read(local_path)
            .map_err(|e| TransportError::Io(format!("{}: {e}", local_path.display())))?;
        let destination = self.config.remote_file(remote_path);
        debug!(remote_path = %destination.display(), bytes = body.len(), "uploading over sftp");

        let session = self.connect()?;
        let sftp = session
            .sftp()
            .map_err(|e| TransportError::Network(format!("sftp subsystem: {e}")))?;
        if let Some(parent) = destination.parent() {
            sftp_create_dirs(&sftp, parent)?;
        }

        // create() truncates, so a retried window overwrites its earlier copy
        let mut file = sftp
            .create(&destination)
            .map_err(|e| TransportError::Io(format!("{}: {e}", destination.display())))?;
        file.write_all(&body)
            .map_err(|e| TransportError::Io(format!("{}: {e}", destination.display())))?;

        Ok(UploadOutcome::Stored)
    }

    fn describe(&self) -> String {
        format!(
            "sftp://{}@{}:{}{}",
            self.config.username, self.config.host, self.config.port, self.config.base_dir
        )
    }

    fn health_check(&self) -> Result<(), TransportError> {
        self.connect().map(|_| ())
    }
}

// ============================================================================
// Directory
// ============================================================================

/// Copies files into a local or mounted directory.
#[derive(Debug, Clone)]
pub struct DirectoryTransport {
    root: PathBuf,
}

impl DirectoryTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Destination of a remote path under the root.
    pub fn destination(&self, remote_path: &str) -> PathBuf {
        self.root.join(remote_path.trim_start_matches('/'))
    }
}

impl Transport for DirectoryTransport {
    fn upload(&self, local_path: &Path, remote_path: &str) -> Result<UploadOutcome, TransportError> {
        let destination = self.destination(remote_path);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TransportError::Io(format!("{}: {e}", parent.display())))?;
        }

        // Copy beside the target, then rename, so readers never see a partial file
        let partial = destination.with_extension("part");
        std::fs::copy(local_path, &partial)
            .map_err(|e| TransportError::Io(format!("{}: {e}", local_path.display())))?;
        std::fs::rename(&partial, &destination)
            .map_err(|e| TransportError::Io(format!("{}: {e}", destination.display())))?;

        Ok(UploadOutcome::Stored)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn health_check(&self) -> Result<(), TransportError> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| TransportError::Io(format!("{}: {e}", self.root.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_config_urls() {
        let config = HttpTransportConfig::new("http://127.0.0.1:8080/bt/", None, "sensorX");
        assert_eq!(
            config.url_for("/lab/scan_data_1.json"),
            "http://127.0.0.1:8080/bt/lab/scan_data_1.json"
        );
        assert_eq!(config.health_url(), "http://127.0.0.1:8080/bt/health");
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let config = HttpTransportConfig::new("http://", None, "sensorX");
        assert!(matches!(
            HttpUploader::new(config),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_sftp_config_parsing() {
        let config =
            SftpTransportConfig::parse("sftp://pi@10.0.0.5:2222/home/pi/scans", None).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 2222);
        assert_eq!(config.username, "pi");
        assert_eq!(
            config.remote_file("lab/scan_data_1.json"),
            PathBuf::from("/home/pi/scans/lab/scan_data_1.json")
        );

        let config = SftpTransportConfig::parse("sftp://pi@laptop", None).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.remote_file("scan_data_1.json"), PathBuf::from("/scan_data_1.json"));

        // User is required
        assert!(matches!(
            SftpTransportConfig::parse("sftp://laptop/scans", None),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_sftp_unreachable_host() {
        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let config = SftpTransportConfig::parse(&format!("sftp://pi@{closed}/scans"), None)
            .unwrap()
            .with_timeout(Duration::from_secs(2));
        let transport = SftpTransport::new(config);

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("scan_data_1.json");
        std::fs::write(&source, "[]").unwrap();

        assert!(matches!(
            transport.upload(&source, "scan_data_1.json"),
            Err(TransportError::Network(_))
        ));
        assert!(matches!(transport.health_check(), Err(TransportError::Network(_))));
    }

    #[test]
    fn test_directory_transport_copies_and_overwrites() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let transport = DirectoryTransport::new(remote.path());
        let source = local.path().join("scan_data_1.json");

        std::fs::write(&source, "[1]").unwrap();
        let outcome = transport.upload(&source, "lab/scan_data_1.json").unwrap();
        assert_eq!(outcome, UploadOutcome::Stored);

        std::fs::write(&source, "[2]").unwrap();
        transport.upload(&source, "lab/scan_data_1.json").unwrap();

        let stored = remote.path().join("lab").join("scan_data_1.json");
        assert_eq!(std::fs::read_to_string(stored).unwrap(), "[2]");
        assert_eq!(std::fs::read_dir(remote.path().join("lab")).unwrap().count(), 1);
    }

    #[test]
    fn test_directory_transport_missing_source() {
        let remote = tempfile::tempdir().unwrap();
        let transport = DirectoryTransport::new(remote.path());
        let result = transport.upload(Path::new("/nonexistent/file.json"), "file.json");
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[test]
    fn test_from_config_schemes() {
        let mut config = Config::default();
        assert!(matches!(
            from_config(&config),
            Err(TransportError::Config(_))
        ));

        config.remote_endpoint = Some("file:///srv/ble".to_string());
        let transport = from_config(&config).unwrap();
        assert_eq!(transport.describe(), "file:///srv/ble");

        config.remote_endpoint = Some("http://127.0.0.1:9/store".to_string());
        let transport = from_config(&config).unwrap();
        assert_eq!(transport.describe(), "http://127.0.0.1:9/store");

        config.remote_endpoint = Some("sftp://pi@laptop/home/pi/scans".to_string());
        config.remote_credentials = Some("secret".to_string());
        let transport = from_config(&config).unwrap();
        assert_eq!(transport.describe(), "sftp://pi@laptop:22/home/pi/scans");
        assert!(!transport.describe().contains("secret"));

        config.remote_endpoint = Some("ftp://laptop/scans".to_string());
        assert!(from_config(&config).is_err());
    }
}
