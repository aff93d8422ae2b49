//! HTTP client for the control plane API.

use anyhow::Result;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

/// CLI exit codes.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const VALIDATION: i32 = 2;
    pub const NOT_FOUND: i32 = 3;
    pub const CONNECTION: i32 = 4;
    pub const AUTH: i32 = 5;
}

/// Errors carrying the exit code they map to.
#[derive(Debug)]
pub struct CliError {
    pub message: String,
    pub exit_code: i32,
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

impl CliError {
    pub fn new(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }
}

/// Thin API client for the control plane.
pub struct ApiClient {
    client: reqwest::Client,
    server_url: String,
}

impl ApiClient {
    pub fn new(server_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.server_url, path))
            .send()
            .await
            .map_err(connection_error)?;
        decode(response).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.server_url, path))
            .json(body)
            .send()
            .await
            .map_err(connection_error)?;
        decode(response).await
    }
}

fn connection_error(e: reqwest::Error) -> anyhow::Error {
    CliError::new(
        format!("cannot reach control plane: {}", e),
        exit_code::CONNECTION,
    )
    .into()
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await.map_err(|e| {
            CliError::new(format!("invalid response: {}", e), exit_code::FAILURE)
        })?);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or(body);

    let exit_code = match status {
        StatusCode::NOT_FOUND => exit_code::NOT_FOUND,
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => exit_code::VALIDATION,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => exit_code::AUTH,
        _ => exit_code::FAILURE,
    };

    Err(CliError::new(format!("{}: {}", status, message), exit_code).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_error_display() {
        let err = CliError::new("playbook not found", exit_code::NOT_FOUND);
        assert_eq!(err.to_string(), "playbook not found");
        assert_eq!(err.exit_code, 3);
    }
}
