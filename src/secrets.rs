//! API-credential resolution. The configured `API_KEY` is either a literal
//! bearer token or an `arn:` reference into an external secret store; a
//! reference is fetched once over HTTPS and cached for the life of the
//! process. A single-flight lock keeps a cold start from issuing parallel
//! fetches, and failures are never cached.

use tokio::sync::Mutex;

use crate::error::GatewayError;

const SECRET_REF_PREFIX: &str = "arn:";

pub struct SecretsResolver {
    raw: String,
    endpoint: Option<String>,
    client: reqwest::Client,
    cache: Mutex<Option<String>>,
}

impl SecretsResolver {
    pub fn new(raw: String, endpoint: Option<String>, client: reqwest::Client) -> Self {
        Self {
            raw,
            endpoint,
            client,
            cache: Mutex::new(None),
        }
    }

    /// The bearer token the HTTP surface accepts. Literal values pass
    /// through untouched; references resolve through the secret store.
    pub async fn get_api_key(&self) -> Result<String, GatewayError> {
        if !self.raw.starts_with(SECRET_REF_PREFIX) {
            return Ok(self.raw.clone());
        }

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            return Ok(cached.clone());
        }

        let resolved = self.fetch().await?;
        *cache = Some(resolved.clone());
        Ok(resolved)
    }

    async fn fetch(&self) -> Result<String, GatewayError> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            GatewayError::SecretResolution(
                "API_KEY is a secret reference but SECRETS_ENDPOINT is not configured".into(),
            )
        })?;

        let url = format!(
            "{}/v1/secrets/{}",
            endpoint.trim_end_matches('/'),
            urlencode(&self.raw)
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::SecretResolution(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::SecretResolution(format!(
                "secret store returned HTTP {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::SecretResolution(e.to_string()))?;
        body.get("api_key")
            .and_then(|k| k.as_str())
            .map(String::from)
            .ok_or_else(|| {
                GatewayError::SecretResolution("secret payload has no api_key field".into())
            })
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_value_passes_through() {
        let resolver = SecretsResolver::new("sk-local-dev".into(), None, reqwest::Client::new());
        assert_eq!(resolver.get_api_key().await.unwrap(), "sk-local-dev");
    }

    #[tokio::test]
    async fn reference_without_endpoint_fails_without_caching() {
        let resolver = SecretsResolver::new(
            "arn:aws:secretsmanager:us-east-1:123:secret:key".into(),
            None,
            reqwest::Client::new(),
        );
        let err = resolver.get_api_key().await.unwrap_err();
        assert_eq!(err.kind(), "secrets:unavailable");
        // The failure must not be cached as a value.
        assert!(resolver.cache.lock().await.is_none());
    }

    #[test]
    fn urlencode_escapes_reference_characters() {
        assert_eq!(urlencode("arn:a/b c"), "arn%3Aa%2Fb%20c");
        assert_eq!(urlencode("plain-value_1.2~x"), "plain-value_1.2~x");
    }
}
