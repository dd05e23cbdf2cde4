use std::{sync::OnceLock, time::Duration};

use reqwest::Client;

pub(crate) fn default_http_client_builder() -> reqwest::ClientBuilder {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("keep-alive"));

    Client::builder()
        .timeout(Duration::from_secs(600))
        .connect_timeout(Duration::from_secs(10))
        // A short idle timeout forces the pool to pick up DNS changes for
        // long-running proxies.
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
}

/// Common HTTP client to re-use as much as possible the same connections.
pub(crate) fn http_client() -> reqwest::Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            default_http_client_builder()
                .build()
                .expect("Failed to build default HTTP client")
        })
        .clone()
}
