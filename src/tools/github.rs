use crate::MeshError;
use crate::tools::base::{Invocation, ToolAdapter, ToolDescriptor};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde_json::{Value, json};

const GITHUB_API: &str = "https://api.github.com";

/// GitHub adapter. The caller's passthrough token travels on every request
/// and is never stored on the adapter.
pub struct GithubAdapter {
    base_url: String,
    client: Client,
    descriptor: ToolDescriptor,
}

impl GithubAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| GITHUB_API.to_string()),
            client: Client::new(),
            descriptor: ToolDescriptor::new("github", "scm")
                .with_description("GitHub repositories: read file content, list repos")
                .with_tags(["code-host", "repos"])
                .with_schema(json!({
                    "type": "object",
                    "properties": {
                        "owner": {"type": "string"},
                        "repo": {"type": "string"},
                        "path": {"type": "string"},
                        "ref": {"type": "string"},
                        "type": {"type": "string"}
                    }
                })),
        }
    }

    async fn api_get(
        &self,
        path: &str,
        query: &[(&str, &str)],
        token: &str,
    ) -> Result<Value, MeshError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "devmesh")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    MeshError::Transient(format!("github request failed: {}", e))
                } else {
                    MeshError::Internal(anyhow::anyhow!("github request failed: {}", e))
                }
            })?;

        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !(200..300).contains(&status) {
            let message = body["message"].as_str().unwrap_or("unknown error").to_string();
            return Err(MeshError::Adapter { status, message });
        }
        Ok(body)
    }

    async fn get_content(&self, args: &Value, token: &str) -> Result<Vec<u8>, MeshError> {
        let (owner, repo) = required_repo(args)?;
        let path = args["path"].as_str().unwrap_or("");
        let mut query = Vec::new();
        if let Some(git_ref) = args["ref"].as_str() {
            query.push(("ref", git_ref));
        }

        let body = self
            .api_get(
                &format!("/repos/{}/{}/contents/{}", owner, repo, path),
                &query,
                token,
            )
            .await?;

        // File responses carry base64 content; directories come back as an
        // array we return verbatim.
        if let Some(encoded) = body["content"].as_str() {
            let stripped: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(stripped)
                .map_err(|e| {
                    MeshError::Internal(anyhow::anyhow!("invalid content encoding: {}", e))
                })?;
            return Ok(decoded);
        }
        serde_json::to_vec(&body).map_err(|e| MeshError::Internal(e.into()))
    }

    async fn list_repositories(&self, args: &Value, token: &str) -> Result<Vec<u8>, MeshError> {
        let repo_type = args["type"].as_str().unwrap_or("owner");
        let body = self
            .api_get("/user/repos", &[("type", repo_type), ("per_page", "30")], token)
            .await?;

        let repos = body.as_array().map(Vec::as_slice).unwrap_or(&[]);
        let summary: Vec<Value> = repos
            .iter()
            .map(|r| {
                json!({
                    "full_name": r["full_name"],
                    "private": r["private"],
                    "default_branch": r["default_branch"],
                })
            })
            .collect();
        serde_json::to_vec(&summary).map_err(|e| MeshError::Internal(e.into()))
    }
}

fn required_repo(args: &Value) -> Result<(&str, &str), MeshError> {
    let owner = args["owner"]
        .as_str()
        .ok_or_else(|| MeshError::InvalidArguments("missing field 'owner'".into()))?;
    let repo = args["repo"]
        .as_str()
        .ok_or_else(|| MeshError::InvalidArguments("missing field 'repo'".into()))?;
    Ok((owner, repo))
}

#[async_trait]
impl ToolAdapter for GithubAdapter {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, call: Invocation<'_>) -> Result<Vec<u8>, MeshError> {
        let token = call.passthrough.ok_or_else(|| {
            MeshError::PermissionDenied("no passthrough credential for tool family 'github'".into())
        })?;

        match call.action {
            "repos/get-content" => self.get_content(call.arguments, token).await,
            "repos/list" | "repos/list-repositories" => {
                self.list_repositories(call.arguments, token).await
            }
            other => Err(MeshError::InvalidArguments(format!(
                "unsupported github action '{}'",
                other
            ))),
        }
    }
}
