use std::time::{Duration, Instant};

use http::{header, Method, Request};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::warn;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a script gets back from a completed exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
    /// Time from sending the request until the body was fully read.
    pub latency: Duration,
}

impl HttpResponse {
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Pooled HTTP/1.1 + HTTP/2 client over rustls, shared by all VUs.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HttpClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(pool_size: usize) -> Self {
        Self::with_timeout(pool_size, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(pool_size: usize, timeout: Duration) -> Self {
        // a provider may already be installed by an earlier client
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        let roots = match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!(error = %e, "no native CA roots, using bundled webpki roots");
                hyper_rustls::HttpsConnectorBuilder::new().with_webpki_roots()
            }
        };
        let https = roots
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .build(https);

        Self { client, timeout }
    }

    /// POSTs `body` as `application/json` and reads the whole response.
    /// Must be called inside a Tokio runtime.
    pub async fn post_json(&self, url: &str, body: String) -> Result<HttpResponse, BoxError> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let started = Instant::now();
        let exchange = async {
            let response = self.client.request(req).await?;
            let status = response.status().as_u16();
            // the body is always read to the end so the connection can be reused
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, BoxError>((status, body))
        };

        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| format!("request timed out after {:?}", self.timeout))??;

        Ok(HttpResponse {
            status,
            body,
            latency: started.elapsed(),
        })
    }
}
