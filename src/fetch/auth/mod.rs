//! Authentication decorators over any [`HttpClient`](super::HttpClient).

mod api_key;
mod url_param;

pub use api_key::ApiKey;
pub use url_param::UrlParam;
