use crate::backends::Registry;
use crate::errors::{ReleaseKitError, Result};
use crate::types::Ecosystem;
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// HTTP registry backend. URL shapes per ecosystem:
/// crates.io, registry.npmjs.org, the PyPI JSON API, and the Go module
/// proxy. A custom `index_url` overrides the default host.
pub struct HttpRegistry {
    client: Client,
    ecosystem: Ecosystem,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(ecosystem: Ecosystem, index_url: Option<&str>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("releasekit/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReleaseKitError::Registry(format!("failed to create HTTP client: {e}")))?;

        let base_url = index_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| default_base_url(ecosystem).to_string());

        Ok(Self {
            client,
            ecosystem,
            base_url,
        })
    }

    fn version_url(&self, name: &str, version: &str) -> String {
        match self.ecosystem {
            Ecosystem::Cargo => format!("{}/api/v1/crates/{name}/{version}", self.base_url),
            Ecosystem::Npm => format!("{}/{name}/{version}", self.base_url),
            Ecosystem::Python => format!("{}/pypi/{name}/{version}/json", self.base_url),
            Ecosystem::Go => format!("{}/{name}/@v/v{version}.info", self.base_url),
        }
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        self.client.get(url).send().map_err(|e| {
            ReleaseKitError::RegistryTransient(format!("HTTP request to {url} failed: {e}"))
        })
    }

    fn classify_status(&self, operation: &str, response: reqwest::blocking::Response) -> Result<bool> {
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status.as_u16() == 404 || status.as_u16() == 410 {
            return Ok(false);
        }
        let message = format!("{operation} returned status {status}");
        if status.is_server_error() || status.as_u16() == 429 {
            Err(ReleaseKitError::RegistryTransient(message))
        } else {
            Err(ReleaseKitError::Registry(message))
        }
    }

    /// URL of the downloadable artifact for checksum verification.
    fn artifact_url(&self, name: &str, version: &str) -> String {
        match self.ecosystem {
            Ecosystem::Cargo => format!(
                "https://static.crates.io/crates/{name}/{name}-{version}.crate"
            ),
            Ecosystem::Npm => {
                let bare = name.rsplit('/').next().unwrap_or(name);
                format!("{}/{name}/-/{bare}-{version}.tgz", self.base_url)
            }
            // Unused for Python: the JSON API reports sha256 digests directly.
            Ecosystem::Python => format!("{}/pypi/{name}/{version}/json", self.base_url),
            Ecosystem::Go => format!("{}/{name}/@v/v{version}.zip", self.base_url),
        }
    }

    fn verify_by_download(&self, name: &str, version: &str, expected: &str) -> Result<()> {
        let url = self.artifact_url(name, version);
        let response = self.get(&url)?;
        let status = response.status();
        if status.as_u16() == 404 || status.as_u16() == 410 {
            return Err(ReleaseKitError::Registry(format!(
                "artifact for {name}@{version} not found at {url}"
            )));
        }
        if !status.is_success() {
            let message = format!("artifact download returned status {status}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ReleaseKitError::RegistryTransient(message)
            } else {
                ReleaseKitError::Registry(message)
            });
        }
        let bytes = response.bytes().map_err(|e| {
            ReleaseKitError::RegistryTransient(format!("failed to read artifact body: {e}"))
        })?;
        let actual = hex_sha256(&bytes);
        if actual != expected {
            return Err(ReleaseKitError::Registry(format!(
                "checksum mismatch for {name}@{version}: registry {actual}, local {expected}"
            )));
        }
        Ok(())
    }

    fn verify_pypi_digest(&self, name: &str, version: &str, expected: &str) -> Result<()> {
        let url = self.version_url(name, version);
        let response = self.get(&url)?;
        if !response.status().is_success() {
            return Err(ReleaseKitError::Registry(format!(
                "release metadata for {name}@{version} not found"
            )));
        }
        let value: serde_json::Value = response.json().map_err(|e| {
            ReleaseKitError::Registry(format!("failed to parse PyPI metadata: {e}"))
        })?;
        let digests: Vec<&str> = value["urls"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|entry| entry["digests"]["sha256"].as_str())
            .collect();
        if digests.is_empty() {
            return Err(ReleaseKitError::Registry(format!(
                "PyPI reported no sha256 digests for {name}@{version}"
            )));
        }
        if digests.iter().any(|d| *d == expected) {
            Ok(())
        } else {
            Err(ReleaseKitError::Registry(format!(
                "checksum mismatch for {name}@{version}: local {expected} not among registry digests"
            )))
        }
    }
}

fn default_base_url(ecosystem: Ecosystem) -> &'static str {
    match ecosystem {
        Ecosystem::Cargo => "https://crates.io",
        Ecosystem::Npm => "https://registry.npmjs.org",
        Ecosystem::Python => "https://pypi.org",
        Ecosystem::Go => "https://proxy.golang.org",
    }
}

pub fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl Registry for HttpRegistry {
    fn check_published(&self, name: &str, version: &str) -> Result<bool> {
        let url = self.version_url(name, version);
        let response = self.get(&url)?;
        self.classify_status("version check", response)
    }

    fn latest_version(&self, name: &str) -> Result<Option<String>> {
        let url = match self.ecosystem {
            Ecosystem::Cargo => format!("{}/api/v1/crates/{name}", self.base_url),
            Ecosystem::Npm => format!("{}/{name}/latest", self.base_url),
            Ecosystem::Python => format!("{}/pypi/{name}/json", self.base_url),
            Ecosystem::Go => format!("{}/{name}/@latest", self.base_url),
        };
        let response = self.get(&url)?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ReleaseKitError::RegistryTransient(format!(
                "latest-version lookup returned status {}",
                response.status()
            )));
        }
        let value: serde_json::Value = response.json().map_err(|e| {
            ReleaseKitError::Registry(format!("failed to parse registry metadata: {e}"))
        })?;
        let version = match self.ecosystem {
            Ecosystem::Cargo => value["crate"]["max_version"].as_str(),
            Ecosystem::Npm => value["version"].as_str(),
            Ecosystem::Python => value["info"]["version"].as_str(),
            Ecosystem::Go => value["Version"].as_str().map(|v| v.trim_start_matches('v')),
        };
        Ok(version.map(|s| s.trim_start_matches('v').to_string()))
    }

    fn verify_checksum(&self, name: &str, version: &str, expected_sha256: &str) -> Result<()> {
        match self.ecosystem {
            Ecosystem::Python => self.verify_pypi_digest(name, version, expected_sha256),
            _ => self.verify_by_download(name, version, expected_sha256),
        }
    }
}

/// Poll a registry until the version is available or the budget expires.
///
/// Each probe is a single blocking call moved off the loop; the sleeps in
/// between are async so cancellation can land. Exhausting the total budget
/// is a transient error (the scheduler retries it up to `max_retries`, after
/// which it becomes permanent).
pub async fn poll_available(
    registry: Arc<dyn Registry>,
    name: &str,
    version: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let registry = Arc::clone(&registry);
        let probe_name = name.to_string();
        let probe_version = version.to_string();
        let published = tokio::task::spawn_blocking(move || {
            registry.check_published(&probe_name, &probe_version)
        })
        .await
        .map_err(|e| ReleaseKitError::Publish(format!("poll task failed: {e}")))??;

        if published {
            return Ok(());
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Err(ReleaseKitError::RegistryTransient(format!(
                "{name}@{version} did not become available within {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_urls_per_ecosystem() {
        let cargo = HttpRegistry::new(Ecosystem::Cargo, None).unwrap();
        assert_eq!(
            cargo.version_url("releasekit-core", "1.0.0"),
            "https://crates.io/api/v1/crates/releasekit-core/1.0.0"
        );

        let npm = HttpRegistry::new(Ecosystem::Npm, None).unwrap();
        assert_eq!(
            npm.version_url("@acme/web", "2.0.0"),
            "https://registry.npmjs.org/@acme/web/2.0.0"
        );

        let python = HttpRegistry::new(Ecosystem::Python, None).unwrap();
        assert_eq!(
            python.version_url("acme-core", "1.0.0"),
            "https://pypi.org/pypi/acme-core/1.0.0/json"
        );

        let go = HttpRegistry::new(Ecosystem::Go, None).unwrap();
        assert_eq!(
            go.version_url("github.com/acme/mod", "1.0.0"),
            "https://proxy.golang.org/github.com/acme/mod/@v/v1.0.0.info"
        );
    }

    #[test]
    fn custom_index_url_overrides_host() {
        let registry =
            HttpRegistry::new(Ecosystem::Npm, Some("https://npm.internal.example/")).unwrap();
        assert_eq!(
            registry.version_url("pkg", "1.0.0"),
            "https://npm.internal.example/pkg/1.0.0"
        );
    }

    #[test]
    fn npm_artifact_url_strips_scope_for_tarball_name() {
        let registry = HttpRegistry::new(Ecosystem::Npm, None).unwrap();
        assert_eq!(
            registry.artifact_url("@acme/web", "2.0.0"),
            "https://registry.npmjs.org/@acme/web/-/web-2.0.0.tgz"
        );
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            hex_sha256(b"releasekit"),
            hex_sha256(b"releasekit"),
        );
        assert_eq!(hex_sha256(b"").len(), 64);
    }

    #[tokio::test]
    async fn poll_available_returns_on_success() {
        struct AlwaysPublished;
        impl Registry for AlwaysPublished {
            fn check_published(&self, _: &str, _: &str) -> Result<bool> {
                Ok(true)
            }
            fn latest_version(&self, _: &str) -> Result<Option<String>> {
                Ok(None)
            }
            fn verify_checksum(&self, _: &str, _: &str, _: &str) -> Result<()> {
                Ok(())
            }
        }

        poll_available(
            Arc::new(AlwaysPublished),
            "pkg",
            "1.0.0",
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn poll_available_times_out_as_transient() {
        struct NeverPublished;
        impl Registry for NeverPublished {
            fn check_published(&self, _: &str, _: &str) -> Result<bool> {
                Ok(false)
            }
            fn latest_version(&self, _: &str) -> Result<Option<String>> {
                Ok(None)
            }
            fn verify_checksum(&self, _: &str, _: &str, _: &str) -> Result<()> {
                Ok(())
            }
        }

        let err = poll_available(
            Arc::new(NeverPublished),
            "pkg",
            "1.0.0",
            Duration::from_millis(30),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }
}
