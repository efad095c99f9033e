use crate::error::TransportError;
use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that injects an API key as an HTTP header.
///
/// Header name and value are validated once, at construction.
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    value: HeaderValue,
}

impl<C> ApiKey<C> {
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self, TransportError> {
        let header_name =
            HeaderName::from_bytes(header_name.as_bytes()).map_err(|e| {
                TransportError::InvalidCredential(format!("header name '{header_name}': {e}"))
            })?;
        Ok(Self {
            inner,
            header_name,
            value: sensitive_value(key)?,
        })
    }

    /// `Authorization: Bearer <key>`, as SIRI providers commonly expect.
    pub fn bearer(inner: C, key: &str) -> Result<Self, TransportError> {
        Ok(Self {
            inner,
            header_name: AUTHORIZATION,
            value: sensitive_value(&format!("Bearer {key}"))?,
        })
    }
}

fn sensitive_value(raw: &str) -> Result<HeaderValue, TransportError> {
    let mut value = HeaderValue::from_str(raw)
        .map_err(|e| TransportError::InvalidCredential(format!("header value: {e}")))?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.headers_mut()
            .insert(self.header_name.clone(), self.value.clone());
        self.inner.execute(req).await
    }
}
