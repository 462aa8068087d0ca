//! HTTP fetch of the nsqd stats document.

use std::path::Path;
use std::time::Duration;

use nsq_exporter_common::{Error, JSON_MIME_TYPE, Result, Snapshot, decode_snapshot};
use reqwest::header::ACCEPT;
use reqwest::{Certificate, Client, Identity, Url};

use crate::config::{NsqdConfig, TlsConfig};

/// Normalize a configured nsqd URL.
///
/// A missing scheme becomes `http://`, an empty path becomes `/stats` and
/// the query is replaced by `format=json`.
pub fn normalize_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Config("nsqd URL is empty".to_string()));
    }

    let lower = raw.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let mut url = Url::parse(&with_scheme)
        .map_err(|e| Error::Config(format!("Invalid nsqd URL '{}': {}", raw, e)))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/stats");
    }
    url.set_query(Some("format=json"));

    Ok(url)
}

/// Fetches one [`Snapshot`] per call.
///
/// Owns a single `reqwest::Client` so connections are reused across scrapes.
#[derive(Debug, Clone)]
pub struct SnapshotFetcher {
    client: Client,
    url: Url,
}

impl SnapshotFetcher {
    pub fn new(url: Url, timeout: Duration, tls: &TlsConfig) -> Result<Self> {
        let client = build_client(timeout, tls)?;
        Ok(Self { client, url })
    }

    pub fn from_config(config: &NsqdConfig) -> Result<Self> {
        Self::new(normalize_url(&config.url)?, config.timeout(), &config.tls)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// One GET, no retry.
    pub async fn fetch(&self) -> Result<Snapshot> {
        let response = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, JSON_MIME_TYPE)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?;

        let body = response.bytes().await.map_err(transport_error)?;
        decode_snapshot(&body)
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Transport(format!("request timed out: {}", e))
    } else {
        Error::Transport(e.to_string())
    }
}

fn build_client(timeout: Duration, tls: &TlsConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(concat!("nsq-exporter/", env!("CARGO_PKG_VERSION")));

    if let Some(path) = &tls.ca_cert {
        let pem = read_pem(path, "CA certificate")?;
        let cert = Certificate::from_pem(&pem).map_err(|e| {
            Error::Config(format!("Invalid CA certificate '{}': {}", path.display(), e))
        })?;
        builder = builder.add_root_certificate(cert);
    }

    match (&tls.client_cert, &tls.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let mut pem = read_pem(cert_path, "client certificate")?;
            pem.push(b'\n');
            pem.extend(read_pem(key_path, "client key")?);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| Error::Config(format!("Invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(Error::Config(
                "client certificate and key must be given together".to_string(),
            ));
        }
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::Config(format!("Failed to read {} '{}': {}", what, path.display(), e)))
}
