use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    tracing_setup::create_upstream_span,
};

const USER_AGENT: &str = "Gatehouse/0.1";

/// Upstream HTTP client using Hyper with Rustls (HTTP/1.1 and HTTPS).
///
/// Responsibilities:
/// * Rewrites `Host` to the upstream authority
/// * Forces HTTP/1.1 on the wire
/// * Issues GET health probes bounded by a timeout
/// * Converts between Hyper body and Axum body types
///
/// Retries are deliberately absent: clients retry, guided by the health cache.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::info!("Created upstream HTTP client");
        Ok(Self { client })
    }

    /// Point `Host` at the upstream authority and fill in a User-Agent if absent.
    fn prepare_headers(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| {
                HttpClientError::InvalidRequest(format!("Outgoing URI has no host: {}", req.uri()))
            })?;

        let host = HeaderValue::from_str(&authority)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        let headers = req.headers_mut();
        headers.insert(header::HOST, host);
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        }
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::prepare_headers(&mut req)?;

        let (mut parts, axum_body) = req.into_parts();
        parts.version = Version::HTTP_11;

        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let span = create_upstream_span(
            uri.host().unwrap_or("unknown"),
            method.as_str(),
            &uri.to_string(),
        );

        let client = self.client.clone();
        async move {
            tracing::debug!("Sending upstream request: {} {}", method, uri);

            match client.request(Request::from_parts(parts, axum_body)).await {
                Ok(response) => {
                    tracing::Span::current().record("http.status_code", response.status().as_u16());

                    let (mut parts, hyper_body) = response.into_parts();
                    // Framing is re-negotiated on the downstream connection
                    parts.headers.remove(header::TRANSFER_ENCODING);

                    Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
                }
                Err(e) => Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                ))),
            }
        }
        .instrument(span)
        .await
    }

    async fn probe(&self, url: &str, timeout_duration: Duration) -> HttpClientResult<StatusCode> {
        let mut request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        Self::prepare_headers(&mut request)?;

        tracing::debug!("Probing {}", url);

        match timeout(timeout_duration, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                // Drain so the connection can be reused
                let _ = response.into_body().collect().await;
                Ok(status)
            }
            Ok(Err(e)) => Err(HttpClientError::ConnectionError(format!(
                "Probe of {url} failed: {e}"
            ))),
            Err(_) => Err(HttpClientError::timeout(timeout_duration)),
        }
    }
}
