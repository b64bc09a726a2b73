//! RPC Transport (C1) — HTTP JSON-RPC and REST calls with explicit deadlines,
//! status-code handling, and body decoding. A single `reqwest::Client` (cheap
//! to clone, internally `Arc`-backed) is shared by every adapter and pool.

use std::time::Duration;

use serde_json::Value;

use crate::errors::TransportError;

const BODY_PREFIX_CAP: usize = 4096;

#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
}

impl Transport {
    /// TLS handshake ~15s, total request deadline ~60s by default; callers
    /// may supply a tighter per-call deadline via `timeout`.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("reqwest client builder with static config must not fail");
        Self { client }
    }

    /// Plain `GET`, returning the response body as a string. Non-2xx and
    /// empty-body-on-2xx responses are both errors.
    pub async fn get(&self, url: &str, timeout: Duration) -> Result<String, TransportError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|source| classify_send_error(url, source))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|source| TransportError::Http {
                url: url.to_string(),
                source,
            })?;

        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body_prefix: truncate(&body),
            });
        }
        if body.is_empty() {
            return Err(TransportError::EmptyBody { url: url.to_string() });
        }
        Ok(body)
    }

    /// JSON-RPC 2.0 call. Surfaces transport failures and `{error:{code,message}}`
    /// payloads uniformly as `TransportError`.
    pub async fn jsonrpc(
        &self,
        url: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|source| classify_send_error(url, source))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|source| TransportError::Http {
                url: url.to_string(),
                source,
            })?;

        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body_prefix: truncate(&text),
            });
        }
        if text.is_empty() {
            return Err(TransportError::EmptyBody { url: url.to_string() });
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|source| TransportError::Decode {
            url: url.to_string(),
            source,
        })?;

        if let Some(err) = parsed.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown rpc error")
                .to_string();
            return Err(TransportError::Rpc {
                url: url.to_string(),
                code,
                message,
            });
        }

        Ok(parsed.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Plain REST-style `POST` with a JSON body, returning the decoded JSON
    /// response. Used by the cursor client and event dispatcher (§4.4, §4.5),
    /// which speak a plain `{ok, ...}` JSON contract rather than JSON-RPC.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let resp = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|source| classify_send_error(url, source))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|source| TransportError::Http {
                url: url.to_string(),
                source,
            })?;

        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body_prefix: truncate(&text),
            });
        }
        if text.is_empty() {
            return Err(TransportError::EmptyBody { url: url.to_string() });
        }

        serde_json::from_str(&text).map_err(|source| TransportError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_send_error(url: &str, source: reqwest::Error) -> TransportError {
    if source.is_timeout() {
        return TransportError::Deadline { url: url.to_string() };
    }
    TransportError::Http {
        url: url.to_string(),
        source,
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= BODY_PREFIX_CAP {
        body.to_string()
    } else {
        body.chars().take(BODY_PREFIX_CAP).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_caps_at_4kib() {
        let long = "a".repeat(BODY_PREFIX_CAP * 2);
        let t = truncate(&long);
        assert_eq!(t.len(), BODY_PREFIX_CAP);
    }

    #[test]
    fn truncate_leaves_short_bodies_untouched() {
        assert_eq!(truncate("short"), "short");
    }
}
