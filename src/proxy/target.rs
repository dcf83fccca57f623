use std::time::Duration;

use http::Uri;
use serde::Serialize;

/// Where a request for one cluster is sent: the local auth proxy, plus what the
/// proxy fronts upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
    /// Path prefix of the upstream API server URL (empty for root)
    pub upstream_path: String,
    /// Host header the upstream expects
    pub upstream_host: Option<String>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl ProxyTarget {
    pub fn local(port: u16, timeout: Duration) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            upstream_path: String::new(),
            upstream_host: None,
            timeout,
        }
    }

    /// Builds the target for a proxy on `port` fronting `server_url`.
    pub fn resolve(port: u16, server_url: &str, timeout: Duration) -> Self {
        let mut target = Self::local(port, timeout);
        match server_url.parse::<Uri>() {
            Ok(uri) => {
                target.upstream_path = uri.path().trim_end_matches('/').to_string();
                target.upstream_host = uri.host().map(str::to_string);
            }
            Err(e) => log::debug!("proxy: cannot parse server url {server_url}: {e}"),
        }
        target
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Full URL for an API path such as `/api/v1/namespaces`.
    pub fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url(), path_and_query)
        } else {
            format!("{}/{}", self.base_url(), path_and_query)
        }
    }
}

/// True when the query string asks for a watch stream (`watch=true` or `watch=1`).
pub fn is_watch_request(uri: &Uri) -> bool {
    uri.query()
        .map(|query| {
            query.split('&').any(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                key == "watch" && matches!(value, "true" | "1")
            })
        })
        .unwrap_or(false)
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}
