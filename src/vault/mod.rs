//! Vault bootstrap: AppRole login, wrapped secret-id unwrap, KV v2 reads,
//! dynamic database credentials and token renewal.

pub mod database;
pub mod renew;

use crate::APP_USER_AGENT;
use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};
use url::Url;

/// `scheme://host:port` of `vault_url` joined with `endpoint`.
#[instrument]
pub fn endpoint_url(vault_url: &str, endpoint: &str) -> Result<String> {
    let url = Url::parse(vault_url)?;

    let scheme = url.scheme();

    let host = url
        .host()
        .ok_or_else(|| anyhow!("Error parsing URL: no host specified"))?
        .to_owned();

    let port = match url.port() {
        Some(p) => p,
        None => match scheme {
            "http" => 80,
            "https" => 443,
            _ => return Err(anyhow!("Error parsing URL: unsupported scheme {scheme}")),
        },
    };

    let endpoint_url = format!("{scheme}://{host}:{port}{endpoint}");

    debug!("endpoint URL: {}", endpoint_url);

    Ok(endpoint_url)
}

pub(crate) fn client() -> Result<Client> {
    Client::builder()
        .user_agent(APP_USER_AGENT)
        .build()
        .context("Failed to build Vault HTTP client")
}

/// Turn a non-success response into an error carrying Vault's first message.
pub(crate) async fn check(url: &str, response: Response) -> Result<Value> {
    let status = response.status();
    let json_response: Value = response.json().await.unwrap_or(Value::Null);

    if !status.is_success() {
        return Err(anyhow!(
            "{} - {}, {}",
            url,
            status,
            json_response["errors"][0].as_str().unwrap_or("")
        ));
    }

    Ok(json_response)
}

/// Unwrap a wrapped secret-id.
/// Create one with:
/// vault write -wrap-ttl=300s -f auth/approle/role/kredo/secret-id
#[instrument(skip(token))]
pub async fn unwrap(vault_url: &str, token: &str) -> Result<String> {
    let unwrap_url = endpoint_url(vault_url, "/v1/sys/wrapping/unwrap")?;

    let response = client()?
        .post(&unwrap_url)
        .header("X-Vault-Token", token)
        .send()
        .await?;

    let json_response = check(&unwrap_url, response).await?;
    let sid = json_response["data"]["secret_id"]
        .as_str()
        .ok_or_else(|| anyhow!("Error parsing JSON response: no secret_id found"))?;

    Ok(sid.to_string())
}

/// Login with AppRole; returns the client token and its lease duration.
/// Create a secret ID with:
/// vault write -f auth/approle/role/kredo/secret-id
#[instrument(skip(sid))]
pub async fn approle_login(vault_url: &str, sid: &str, rid: &str) -> Result<(String, u64)> {
    let login_payload = json!({
        "role_id": rid,
        "secret_id": sid
    });

    debug!("login URL: {}, role ID: {}", vault_url, rid);

    let response = client()?.post(vault_url).json(&login_payload).send().await?;

    let json_response = check(vault_url, response).await?;
    let token = json_response["auth"]["client_token"]
        .as_str()
        .ok_or_else(|| anyhow!("Error parsing JSON response: no client_token found"))?;
    let lease_duration = json_response["auth"]["lease_duration"]
        .as_u64()
        .unwrap_or(1800);

    Ok((token.to_string(), lease_duration))
}

/// Read `key` from a KV v2 secret at `path` (e.g. `secret/data/kredo/jwt`).
#[instrument(skip(token))]
pub async fn kv_secret(
    vault_url: &str,
    token: &SecretString,
    path: &str,
    key: &str,
) -> Result<SecretString> {
    let kv_url = endpoint_url(vault_url, &format!("/v1/{}", path.trim_start_matches('/')))?;

    let response = client()?
        .get(&kv_url)
        .header("X-Vault-Token", token.expose_secret())
        .send()
        .await?;

    let json_response = check(&kv_url, response).await?;
    let value = json_response["data"]["data"][key]
        .as_str()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("Error parsing JSON response: no {key} found at {path}"))?;

    Ok(SecretString::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() -> Result<()> {
        assert_eq!(
            endpoint_url("https://vault.tld/v1/auth/approle/login", "/v1/sys/wrapping/unwrap")?,
            "https://vault.tld:443/v1/sys/wrapping/unwrap"
        );
        assert_eq!(
            endpoint_url("http://vault.tld:8200/v1/auth/approle/login", "/v1/database/creds/kredo")?,
            "http://vault.tld:8200/v1/database/creds/kredo"
        );
        Ok(())
    }

    #[test]
    fn test_endpoint_url_rejects_unknown_schemes() {
        assert!(endpoint_url("ftp://vault.tld", "/v1").is_err());
        assert!(endpoint_url("not a url", "/v1").is_err());
    }
}
