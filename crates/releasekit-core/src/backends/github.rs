use crate::backends::{Forge, PrState};
use crate::errors::{ReleaseKitError, Result};
use crate::types::{PrHandle, ReleaseHandle};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct CreatePullRequestPayload {
    title: String,
    head: String,
    base: String,
    body: String,
}

#[derive(Debug, Serialize)]
struct UpdatePullRequestPayload {
    title: String,
    body: String,
}

#[derive(Debug, Serialize)]
struct CreateReleasePayload {
    tag_name: String,
    name: String,
    body: String,
    draft: bool,
    prerelease: bool,
}

#[derive(Debug, Serialize)]
struct DispatchPayload<'a> {
    event_type: &'a str,
    client_payload: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
    html_url: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Release {
    html_url: String,
}

/// GitHub forge backend over the REST v3 API.
///
/// Reads `GITHUB_TOKEN` (or `GH_TOKEN`); the core never touches the
/// environment directly.
pub struct GitHubForge {
    client: Client,
    api_base: String,
    repo: String,
    token: String,
}

impl GitHubForge {
    pub fn new(owner: &str, repo: &str) -> Result<Self> {
        let token = std::env::var("GITHUB_TOKEN")
            .or_else(|_| std::env::var("GH_TOKEN"))
            .map_err(|_| {
                ReleaseKitError::Forge(
                    "GITHUB_TOKEN (or GH_TOKEN) is required for forge operations".into(),
                )
            })?;
        Self::with_token(owner, repo, token, "https://api.github.com")
    }

    pub fn with_token(owner: &str, repo: &str, token: String, api_base: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("releasekit/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReleaseKitError::Forge(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            repo: format!("{owner}/{repo}"),
            token,
        })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}", self.api_base, self.repo, path)
    }

    fn send_json<T: Serialize>(
        &self,
        method: reqwest::Method,
        url: &str,
        payload: Option<&T>,
    ) -> Result<reqwest::blocking::Response> {
        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(body) = payload {
            request = request.json(body);
        }
        request
            .send()
            .map_err(|e| ReleaseKitError::ForgeTransient(format!("HTTP request to {url} failed: {e}")))
    }

    fn error_from(&self, operation: &str, response: reqwest::blocking::Response) -> ReleaseKitError {
        let status = response.status();
        let text = response.text().unwrap_or_default();
        let message = format!("{operation} failed for {}: {text} (status {status})", self.repo);
        if status.is_server_error() || status.as_u16() == 429 {
            ReleaseKitError::ForgeTransient(message)
        } else {
            ReleaseKitError::Forge(message)
        }
    }
}

impl Forge for GitHubForge {
    fn is_available(&self) -> Result<bool> {
        let url = format!("{}/repos/{}", self.api_base, self.repo);
        let response = self.send_json::<()>(reqwest::Method::GET, &url, None)?;
        Ok(response.status().is_success())
    }

    fn create_pr(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<PrHandle> {
        let payload = CreatePullRequestPayload {
            title: title.to_string(),
            head: branch.to_string(),
            base: base.to_string(),
            body: body.to_string(),
        };
        let response =
            self.send_json(reqwest::Method::POST, &self.url("pulls"), Some(&payload))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            // An open PR for this branch already exists; find and update it.
            if status.as_u16() == 422 && text.contains("A pull request already exists") {
                let existing = self
                    .list_open_for_branch(branch)?
                    .ok_or_else(|| ReleaseKitError::Forge(format!(
                        "GitHub reported an existing PR for '{branch}' but none was found"
                    )))?;
                self.update_pr(&existing, title, body)?;
                self.add_labels(&existing, labels)?;
                return Ok(existing);
            }
            return Err(if status.is_server_error() {
                ReleaseKitError::ForgeTransient(format!("create PR failed: {text} ({status})"))
            } else {
                ReleaseKitError::Forge(format!("create PR failed: {text} ({status})"))
            });
        }

        let pr: PullRequest = response
            .json()
            .map_err(|e| ReleaseKitError::Forge(format!("failed to parse PR response: {e}")))?;
        let handle = PrHandle {
            number: pr.number,
            url: pr.html_url,
        };
        self.add_labels(&handle, labels)?;
        Ok(handle)
    }

    fn update_pr(&self, handle: &PrHandle, title: &str, body: &str) -> Result<()> {
        let payload = UpdatePullRequestPayload {
            title: title.to_string(),
            body: body.to_string(),
        };
        let url = self.url(&format!("pulls/{}", handle.number));
        let response = self.send_json(reqwest::Method::PATCH, &url, Some(&payload))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_from("update PR", response))
        }
    }

    fn get_pr_body(&self, handle: &PrHandle) -> Result<String> {
        let url = self.url(&format!("pulls/{}", handle.number));
        let response = self.send_json::<()>(reqwest::Method::GET, &url, None)?;
        if !response.status().is_success() {
            return Err(self.error_from("get PR", response));
        }
        let pr: PullRequest = response
            .json()
            .map_err(|e| ReleaseKitError::Forge(format!("failed to parse PR response: {e}")))?;
        Ok(pr.body.unwrap_or_default())
    }

    fn list_prs(&self, label: Option<&str>, state: PrState) -> Result<Vec<PrHandle>> {
        // The issues endpoint supports label filtering; PRs are issues.
        let state_param = match state {
            PrState::Open => "open",
            PrState::Merged | PrState::All => "all",
        };
        let mut url = format!(
            "{}?state={state_param}&per_page=50",
            self.url("issues")
        );
        if let Some(label) = label {
            url.push_str(&format!("&labels={label}"));
        }

        #[derive(Debug, Deserialize)]
        struct Issue {
            number: u64,
            html_url: String,
            pull_request: Option<serde_json::Value>,
        }

        let response = self.send_json::<()>(reqwest::Method::GET, &url, None)?;
        if !response.status().is_success() {
            return Err(self.error_from("list PRs", response));
        }
        let issues: Vec<Issue> = response
            .json()
            .map_err(|e| ReleaseKitError::Forge(format!("failed to parse PR list: {e}")))?;

        let mut handles = Vec::new();
        for issue in issues {
            if issue.pull_request.is_none() {
                continue;
            }
            if state == PrState::Merged && !self.pr_is_merged(issue.number)? {
                continue;
            }
            handles.push(PrHandle {
                number: issue.number,
                url: issue.html_url,
            });
        }
        Ok(handles)
    }

    fn merge_pr(&self, handle: &PrHandle) -> Result<()> {
        let url = self.url(&format!("pulls/{}/merge", handle.number));
        let response = self.send_json(
            reqwest::Method::PUT,
            &url,
            Some(&serde_json::json!({"merge_method": "squash"})),
        )?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_from("merge PR", response))
        }
    }

    fn create_release(
        &self,
        tag: &str,
        name: &str,
        body: &str,
        draft: bool,
        prerelease: bool,
    ) -> Result<ReleaseHandle> {
        let payload = CreateReleasePayload {
            tag_name: tag.to_string(),
            name: name.to_string(),
            body: body.to_string(),
            draft,
            prerelease,
        };
        let response =
            self.send_json(reqwest::Method::POST, &self.url("releases"), Some(&payload))?;
        if !response.status().is_success() {
            return Err(self.error_from("create release", response));
        }
        let release: Release = response
            .json()
            .map_err(|e| ReleaseKitError::Forge(format!("failed to parse release response: {e}")))?;
        Ok(ReleaseHandle {
            tag: tag.to_string(),
            url: release.html_url,
        })
    }

    fn release_exists(&self, tag: &str) -> Result<bool> {
        let url = self.url(&format!("releases/tags/{tag}"));
        let response = self.send_json::<()>(reqwest::Method::GET, &url, None)?;
        Ok(response.status().is_success())
    }

    fn add_labels(&self, handle: &PrHandle, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let url = self.url(&format!("issues/{}/labels", handle.number));
        let response = self.send_json(
            reqwest::Method::POST,
            &url,
            Some(&serde_json::json!({"labels": labels})),
        )?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_from("add labels", response))
        }
    }

    fn remove_labels(&self, handle: &PrHandle, labels: &[String]) -> Result<()> {
        for label in labels {
            let url = self.url(&format!("issues/{}/labels/{label}", handle.number));
            let response = self.send_json::<()>(reqwest::Method::DELETE, &url, None)?;
            // 404 means the label was never attached; not an error.
            if !response.status().is_success() && response.status().as_u16() != 404 {
                return Err(self.error_from("remove labels", response));
            }
        }
        Ok(())
    }

    fn repository_dispatch(&self, event_type: &str, payload: &serde_json::Value) -> Result<()> {
        let body = DispatchPayload {
            event_type,
            client_payload: payload,
        };
        let response =
            self.send_json(reqwest::Method::POST, &self.url("dispatches"), Some(&body))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_from("repository dispatch", response))
        }
    }
}

impl GitHubForge {
    fn list_open_for_branch(&self, branch: &str) -> Result<Option<PrHandle>> {
        let owner = self.repo.split('/').next().unwrap_or("");
        let url = format!(
            "{}?state=open&head={owner}:{branch}",
            self.url("pulls")
        );
        let response = self.send_json::<()>(reqwest::Method::GET, &url, None)?;
        if !response.status().is_success() {
            return Err(self.error_from("list PRs", response));
        }
        let prs: Vec<PullRequest> = response
            .json()
            .map_err(|e| ReleaseKitError::Forge(format!("failed to parse PR list: {e}")))?;
        Ok(prs.first().map(|pr| PrHandle {
            number: pr.number,
            url: pr.html_url.clone(),
        }))
    }

    fn pr_is_merged(&self, number: u64) -> Result<bool> {
        let url = self.url(&format!("pulls/{number}/merge"));
        let response = self.send_json::<()>(reqwest::Method::GET, &url, None)?;
        // 204 when merged, 404 otherwise.
        Ok(response.status().as_u16() == 204)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serialization_escapes_content() {
        let payload = CreatePullRequestPayload {
            title: "Release \"pending\"".to_string(),
            head: "release/releasekit".to_string(),
            base: "main".to_string(),
            body: "line one\nline two".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("Release \\\"pending\\\""));
        assert!(json.contains("line one\\nline two"));
    }

    #[test]
    fn url_construction() {
        let forge = GitHubForge::with_token(
            "acme",
            "monorepo",
            "token".into(),
            "https://api.github.com/",
        )
        .unwrap();
        assert_eq!(
            forge.url("pulls"),
            "https://api.github.com/repos/acme/monorepo/pulls"
        );
    }

    #[test]
    fn dispatch_payload_shape() {
        let payload = serde_json::json!({"plan": "x"});
        let body = DispatchPayload {
            event_type: "releasekit-published",
            client_payload: &payload,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["event_type"], "releasekit-published");
        assert_eq!(json["client_payload"]["plan"], "x");
    }
}
