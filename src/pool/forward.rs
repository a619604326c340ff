//! Request forwarding.
//!
//! [`Forward`] is the capability a backend handle is bound to: take one
//! buffered request, deliver it to a specific origin, and hand back the
//! buffered response. [`ReverseProxy`] is the production implementation on
//! the shared `reqwest` client; the response-cache interceptor composes
//! here rather than in the pool so a rebound handle keeps its caching
//! behavior.
//!
//! Requests and responses are fully buffered. A retry therefore never
//! runs after bytes from a previous attempt reached the client.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::http::request;
use hyper::{HeaderMap, Method, Response, header};
use url::Url;

use super::cache::ResponseCache;
use crate::error::{Error, Result};

/// A buffered client request, cheap enough to clone per forward attempt.
#[derive(Clone)]
pub struct ProxyRequest {
    /// Request method, forwarded verbatim.
    pub method: Method,
    /// Path plus query, forwarded verbatim.
    pub path_and_query: String,
    /// Client headers; hop-by-hop entries are dropped at forward time.
    pub headers: HeaderMap,
    /// Buffered request body.
    pub body: Bytes,
}

impl ProxyRequest {
    /// Build a request from buffered parts.
    pub fn new(method: Method, target: &str, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            path_and_query: target.to_string(),
            headers,
            body,
        }
    }

    /// Build a request from hyper request parts and a collected body.
    pub fn from_parts(parts: &request::Parts, body: Bytes) -> Self {
        let target = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());

        Self::new(parts.method.clone(), target, parts.headers.clone(), body)
    }

    /// The request path without the query string. This is the cache key.
    pub fn path(&self) -> &str {
        self.path_and_query
            .split('?')
            .next()
            .unwrap_or(&self.path_and_query)
    }
}

/// Something that can deliver a request to an upstream origin.
#[async_trait]
pub trait Forward: Send + Sync {
    /// Forward `req` and return the buffered upstream response.
    async fn forward(&self, req: ProxyRequest) -> Result<Response<Full<Bytes>>>;
}

/// Forwarder bound to one origin over the shared HTTP client.
pub struct ReverseProxy {
    origin: Url,
    client: reqwest::Client,
    cache: Option<ResponseCache>,
}

impl ReverseProxy {
    /// Bind a forwarder to `origin`. When `cache` is present, `GET`
    /// response bodies are admitted under their request path.
    pub fn new(origin: Url, client: reqwest::Client, cache: Option<ResponseCache>) -> Self {
        Self {
            origin,
            client,
            cache,
        }
    }

    fn target(&self, path_and_query: &str) -> Result<Url> {
        self.origin
            .join(path_and_query)
            .map_err(|_| Error::InvalidUrl(format!("{}{path_and_query}", self.origin)))
    }
}

#[async_trait]
impl Forward for ReverseProxy {
    async fn forward(&self, req: ProxyRequest) -> Result<Response<Full<Bytes>>> {
        let target = self.target(&req.path_and_query)?;

        let mut builder = self.client.request(req.method.clone(), target);
        for (name, value) in &req.headers {
            if name == header::HOST || is_hop_by_hop_header(name.as_str()) {
                continue;
            }
            builder = builder.header(name.clone(), value.clone());
        }
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }

        let upstream = builder.send().await.map_err(|source| Error::Transport {
            url: self.origin.clone(),
            source,
        })?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream.bytes().await.map_err(|source| Error::Transport {
            url: self.origin.clone(),
            source,
        })?;

        if let Some(cache) = &self.cache {
            if req.method == Method::GET {
                cache.insert(req.path(), body.clone());
            }
        }

        let mut response = Response::builder().status(status);
        for (name, value) in &headers {
            if !is_hop_by_hop_header(name.as_str()) {
                response = response.header(name.clone(), value.clone());
            }
        }

        Ok(response.body(Full::new(body))?)
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("keep-alive"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("x-custom-header"));
    }

    #[test]
    fn test_proxy_request_path_strips_query() {
        let req = ProxyRequest::new(
            Method::GET,
            "/foo/bar?q=1&x=2",
            HeaderMap::new(),
            Bytes::new(),
        );
        assert_eq!(req.path(), "/foo/bar");
        assert_eq!(req.path_and_query, "/foo/bar?q=1&x=2");
    }

    #[test]
    fn test_proxy_request_path_without_query() {
        let req = ProxyRequest::new(Method::GET, "/foo", HeaderMap::new(), Bytes::new());
        assert_eq!(req.path(), "/foo");
    }

    #[test]
    fn test_target_joins_origin_and_path() {
        let proxy = ReverseProxy::new(
            Url::parse("http://localhost:9000").unwrap(),
            reqwest::Client::new(),
            None,
        );

        assert_eq!(
            proxy.target("/foo?q=1").unwrap().as_str(),
            "http://localhost:9000/foo?q=1"
        );
        assert_eq!(
            proxy.target("/").unwrap().as_str(),
            "http://localhost:9000/"
        );
    }
}
