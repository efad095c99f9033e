//! HTTP transport for feeds. [`HttpClient`] is the seam; authentication is
//! layered on by the decorators in [`auth`].

mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use bytes::Bytes;
use tracing::debug;

use crate::error::TransportError;

/// GETs `url` and returns the body of a 2xx response.
#[tracing::instrument(skip(client), fields(url = %url))]
pub async fn fetch_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<Bytes, TransportError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let req = reqwest::Request::new(reqwest::Method::GET, parsed);

    let resp = client.execute(req).await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(TransportError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    let body = resp.bytes().await?;
    debug!(bytes = body.len(), "Feed bytes received");
    Ok(body)
}

/// Loads feed data from a local file path or fetches it over HTTP.
pub async fn fetch_source<C: HttpClient + ?Sized>(
    client: &C,
    source: &str,
) -> Result<Bytes, TransportError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        fetch_bytes(client, source).await
    } else {
        Ok(Bytes::from(tokio::fs::read(source).await?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one request, answering with `status` and the request head as body.
    pub(crate) async fn echo_server(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                head.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.write_all(&head).await.unwrap();
        });
        format!("http://{addr}/feed")
    }

    pub(crate) fn local_client() -> BasicClient {
        BasicClient::from_client(reqwest::Client::builder().no_proxy().build().unwrap())
    }

    #[tokio::test]
    async fn test_fetch_bytes_returns_body() {
        let url = echo_server(200).await;
        let body = fetch_bytes(&local_client(), &url).await.unwrap();
        assert!(String::from_utf8_lossy(&body).starts_with("GET /feed"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let url = echo_server(503).await;
        let err = fetch_bytes(&local_client(), &url).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = fetch_bytes(&local_client(), "not a url").await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_fetch_source_reads_local_file() {
        let path = std::env::temp_dir().join("gtfs_rt_reconciler_fetch_source.bin");
        std::fs::write(&path, b"\x0a\x00").unwrap();
        let bytes = fetch_source(&local_client(), path.to_str().unwrap()).await.unwrap();
        assert_eq!(&bytes[..], b"\x0a\x00");
        std::fs::remove_file(&path).unwrap();

        let missing = fetch_source(&local_client(), "/no/such/feed.pb").await;
        assert!(matches!(missing, Err(TransportError::Io(_))));
    }
}
