//! HTTP transport used by the registry client. Transports compose: `TracingTransport` wraps any
//! other transport and logs each exchange.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Request, StatusCode, Version};
use std::time::Duration;
use tracing::debug;

/// A fully buffered HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: Request) -> Result<HttpResponse, reqwest::Error>;
}

/// Plain reqwest transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent(concat!("kube-image-puller/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<HttpResponse, reqwest::Error> {
        let response = self.client.execute(request).await?;
        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(HttpResponse {
            status,
            version,
            headers,
            body,
        })
    }
}

/// Logs every request as an equivalent cURL command and dumps the raw response.
pub struct TracingTransport<T> {
    inner: T,
    show_secrets: bool,
}

impl<T: HttpTransport> TracingTransport<T> {
    pub fn new(inner: T, show_secrets: bool) -> Self {
        Self {
            inner,
            show_secrets,
        }
    }
}

#[async_trait]
impl<T: HttpTransport> HttpTransport for TracingTransport<T> {
    async fn send(&self, request: Request) -> Result<HttpResponse, reqwest::Error> {
        debug!(
            target: "kube_image_puller::http",
            "{}",
            curl_command(&request, self.show_secrets)
        );
        match self.inner.send(request).await {
            Ok(response) => {
                debug!(target: "kube_image_puller::http", "{}", dump_response(&response));
                Ok(response)
            }
            Err(e) => {
                debug!(target: "kube_image_puller::http", error = %e, "Request failed");
                Err(e)
            }
        }
    }
}

/// Render a request as a cURL command line. Headers are sorted by name.
pub fn curl_command(request: &Request, show_secrets: bool) -> String {
    let mut command = format!("curl -X '{}'", request.method());

    let mut headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .map(|(name, value)| {
            let value = if name == AUTHORIZATION && !show_secrets {
                redact_authorization(value.to_str().unwrap_or_default())
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name.as_str().to_string(), value)
        })
        .collect();
    headers.sort();

    for (name, value) in headers {
        command.push_str(&format!(" -H '{}: {}'", canonical_header_name(&name), value));
    }

    if let Some(body) = request.body().and_then(|body| body.as_bytes()) {
        if !body.is_empty() {
            command.push_str(&format!(" -d '{}'", String::from_utf8_lossy(body)));
        }
    }

    command.push_str(&format!(" '{}'", request.url()));
    command
}

/// Render a response the way it came over the wire: status line, headers, blank line, body.
pub fn dump_response(response: &HttpResponse) -> String {
    let mut dump = format!("{:?} {}\n", response.version, response.status);
    for (name, value) in &response.headers {
        dump.push_str(&format!(
            "{}: {}\n",
            canonical_header_name(name.as_str()),
            String::from_utf8_lossy(value.as_bytes())
        ));
    }
    dump.push('\n');
    dump.push_str(&String::from_utf8_lossy(&response.body));
    dump
}

fn redact_authorization(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, _)) => format!("{} <redacted>", scheme),
        None => "<redacted>".to_string(),
    }
}

/// "www-authenticate" -> "Www-Authenticate"
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
