//! Reverse proxy for the upload path: forwards the client's request
//! byte-transparently to the selected storage replica and relays the reply.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use common::header;

pub(crate) const PROXY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub(crate) struct ProxiedResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl IntoResponse for ProxiedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Forwards one request to `{target_base}{path_and_query}`. Hop-by-hop
/// headers are stripped in both directions; the original host rides along in
/// `x-forwarded-host`. A transport failure surfaces as an error so the caller
/// can run its offline hook; logical failures from the storage node are
/// relayed untouched.
pub(crate) async fn forward(
    http: &reqwest::Client,
    method: Method,
    target_base: &str,
    path_and_query: &str,
    mut headers: HeaderMap,
    body: Bytes,
) -> Result<ProxiedResponse> {
    let url = format!("{target_base}{path_and_query}");

    let original_host = headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);
    if let Some(host) = original_host {
        headers.insert(header::FORWARDED_HOST, host);
    }

    let response = http
        .request(method, &url)
        .headers(headers)
        .body(body)
        .timeout(PROXY_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("failed to reach storage node at {url}"))?;

    let status = response.status();
    let mut response_headers = response.headers().clone();
    response_headers.remove(CONTENT_LENGTH);
    response_headers.remove(TRANSFER_ENCODING);
    response_headers.remove(CONNECTION);

    let body = response
        .bytes()
        .await
        .with_context(|| format!("failed to read storage node response from {url}"))?;

    Ok(ProxiedResponse {
        status,
        headers: response_headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::net::SocketAddr;

    async fn spawn_stub(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn forward_relays_body_and_sets_forwarded_host() {
        async fn echo(headers: HeaderMap, body: Bytes) -> Json<serde_json::Value> {
            let forwarded = headers
                .get(header::FORWARDED_HOST)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Json(serde_json::json!({
                "forwarded_host": forwarded,
                "body": String::from_utf8_lossy(&body),
            }))
        }

        let addr = spawn_stub(Router::new().route("/v1/upload", post(echo))).await;

        let mut headers = HeaderMap::new();
        headers.insert(HOST, "tracker.example".parse().unwrap());

        let proxied = forward(
            &reqwest::Client::new(),
            Method::POST,
            &format!("http://{addr}"),
            "/v1/upload",
            headers,
            Bytes::from_static(b"payload"),
        )
        .await
        .unwrap();

        assert_eq!(proxied.status, StatusCode::OK);
        let echoed: serde_json::Value = serde_json::from_slice(&proxied.body).unwrap();
        assert_eq!(echoed["forwarded_host"], "tracker.example");
        assert_eq!(echoed["body"], "payload");
    }

    #[tokio::test]
    async fn forward_fails_on_unreachable_target() {
        let result = forward(
            &reqwest::Client::new(),
            Method::POST,
            "http://127.0.0.1:9",
            "/v1/upload",
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;

        assert!(result.is_err());
    }
}
