use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::version::Info;
use reqwest::StatusCode;

use crate::error::Result;
use crate::proxy::ProxyTarget;

/// Result of one reachability check against a cluster's API server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeOutcome {
    /// The API server (or at least the proxy in front of it) answered
    pub online: bool,
    /// The answer was a success for our identity
    pub accessible: bool,
    pub reason: Option<String>,
    pub version: Option<Info>,
}

impl ProbeOutcome {
    pub fn accessible(version: Option<Info>) -> Self {
        Self {
            online: true,
            accessible: true,
            reason: None,
            version,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            online: true,
            accessible: false,
            reason: Some(reason.into()),
            version: None,
        }
    }

    pub fn offline(reason: impl Into<String>) -> Self {
        Self {
            online: false,
            accessible: false,
            reason: Some(reason.into()),
            version: None,
        }
    }
}

/// Checks whether a cluster is reachable through its proxy.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    async fn probe(&self, target: &ProxyTarget, timeout: Duration) -> ProbeOutcome;
}

/// `GET /version` through the local proxy.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        // The proxy listens on loopback; a system proxy must never sit in between
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ClusterProbe for HttpProbe {
    async fn probe(&self, target: &ProxyTarget, timeout: Duration) -> ProbeOutcome {
        let url = target.url_for("/version");

        let response = match self.client.get(&url).timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return ProbeOutcome::offline(format!("timed out after {}s", timeout.as_secs()))
            }
            Err(e) => return ProbeOutcome::offline(format!("unreachable: {e}")),
        };

        let status = response.status();
        match status {
            s if s.is_success() => match response.json::<Info>().await {
                Ok(info) => ProbeOutcome::accessible(Some(info)),
                Err(e) => {
                    log::debug!("cluster: unexpected /version body from {url}: {e}");
                    ProbeOutcome::accessible(None)
                }
            },
            StatusCode::UNAUTHORIZED => ProbeOutcome::denied("invalid credentials"),
            StatusCode::FORBIDDEN => ProbeOutcome::denied("access forbidden"),
            // The proxy itself answered but could not reach the upstream
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                ProbeOutcome::offline(format!("api server unreachable ({status})"))
            }
            _ => ProbeOutcome::denied(format!("unexpected response {status}")),
        }
    }
}

/// Best-effort distribution name from the server's reported version.
pub fn detect_distro(info: &Info) -> Option<String> {
    let version = info.git_version.to_lowercase();
    let distro = if version.contains("-eks-") {
        "eks"
    } else if version.contains("-gke.") {
        "gke"
    } else if version.contains("+k3s") {
        "k3s"
    } else if version.contains("+rke2") {
        "rke2"
    } else if version.contains("-mirantis-") {
        "mirantis"
    } else if version.contains("+vmware") {
        "vmware"
    } else if version.is_empty() {
        return None;
    } else {
        "unknown"
    };
    Some(distro.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSION_BODY: &str = r#"{
        "major": "1",
        "minor": "30",
        "gitVersion": "v1.30.2+k3s1",
        "gitCommit": "abc",
        "gitTreeState": "clean",
        "buildDate": "2024-06-01T00:00:00Z",
        "goVersion": "go1.22.4",
        "compiler": "gc",
        "platform": "linux/amd64"
    }"#;

    fn target_for(server: &mockito::Server) -> ProxyTarget {
        let host_port = server.host_with_port();
        let (_, port) = host_port.rsplit_once(':').expect("host:port");
        ProxyTarget::local(port.parse().expect("port"), Duration::from_secs(30))
    }

    async fn probe_status(status: usize, body: &str) -> ProbeOutcome {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/version")
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let probe = HttpProbe::new().expect("client");
        let outcome = probe.probe(&target_for(&server), Duration::from_secs(5)).await;
        mock.assert_async().await;
        outcome
    }

    #[tokio::test]
    async fn test_success_parses_version() {
        let outcome = probe_status(200, VERSION_BODY).await;
        assert!(outcome.online);
        assert!(outcome.accessible);
        let info = outcome.version.expect("version info");
        assert_eq!(info.git_version, "v1.30.2+k3s1");
        assert_eq!(detect_distro(&info).as_deref(), Some("k3s"));
    }

    #[tokio::test]
    async fn test_unauthorized_and_forbidden_are_online_but_denied() {
        let unauthorized = probe_status(401, "{}").await;
        assert!(unauthorized.online);
        assert!(!unauthorized.accessible);
        assert_eq!(unauthorized.reason.as_deref(), Some("invalid credentials"));

        let forbidden = probe_status(403, "{}").await;
        assert!(forbidden.online);
        assert!(!forbidden.accessible);
        assert_eq!(forbidden.reason.as_deref(), Some("access forbidden"));
    }

    #[tokio::test]
    async fn test_gateway_errors_mean_offline() {
        let outcome = probe_status(503, "").await;
        assert!(!outcome.online);
        assert!(!outcome.accessible);
    }

    #[tokio::test]
    async fn test_connection_refused_is_offline() {
        let port = {
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let probe = HttpProbe::new().expect("client");
        let outcome = probe
            .probe(&ProxyTarget::local(port, Duration::from_secs(30)), Duration::from_secs(2))
            .await;
        assert!(!outcome.online);
        assert!(outcome.reason.is_some());
    }

    #[test]
    fn test_detect_distro() {
        let info = |v: &str| Info {
            git_version: v.to_string(),
            ..Info::default()
        };
        assert_eq!(detect_distro(&info("v1.29.4-eks-036c24b")).as_deref(), Some("eks"));
        assert_eq!(detect_distro(&info("v1.28.9-gke.1000000")).as_deref(), Some("gke"));
        assert_eq!(detect_distro(&info("v1.30.0")).as_deref(), Some("unknown"));
        assert_eq!(detect_distro(&info("")), None);
    }
}
