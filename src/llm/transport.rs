//! HTTP plumbing shared by the chat and responses clients.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::LlmError;

#[derive(Debug, serde::Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, serde::Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// POST `body` as JSON and decode a successful response.
///
/// Send failures become [`LlmError::Timeout`]. A 2xx body that does not
/// decode becomes [`LlmError::EmptyResponse`].
pub(crate) async fn post_json<B, R>(
    client: &Client,
    url: &str,
    api_key: &SecretString,
    provider: &str,
    body: &B,
) -> Result<R, LlmError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let response = client
        .post(url)
        .bearer_auth(api_key.expose_secret())
        .json(body)
        .send()
        .await
        .map_err(|e| LlmError::Timeout {
            provider: provider.to_string(),
            reason: format!("Failed to send request: {e}"),
        })?;

    let status = response.status();
    let headers = response.headers().clone();
    let text = response.text().await.map_err(|e| LlmError::Timeout {
        provider: provider.to_string(),
        reason: format!("Failed to read response body: {e}"),
    })?;

    if !status.is_success() {
        return Err(classify_failure(provider, status, &headers, &text));
    }

    debug!(provider, status = status.as_u16(), bytes = text.len(), "LLM response received");

    serde_json::from_str(&text).map_err(|e| LlmError::EmptyResponse {
        provider: provider.to_string(),
        reason: format!("Failed to parse response: {e}"),
    })
}

/// Map a non-2xx response onto the error taxonomy.
pub(crate) fn classify_failure(
    provider: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> LlmError {
    let provider = provider.to_string();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return LlmError::RateLimited {
            provider,
            retry_after: retry_after(headers),
        };
    }

    let reason = error_message(body);
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        LlmError::Timeout { provider, reason }
    } else if status.is_server_error() {
        LlmError::Api {
            provider,
            status: status.as_u16(),
            reason,
        }
    } else {
        LlmError::InvalidRequest {
            provider,
            status: status.as_u16(),
            reason,
        }
    }
}

/// `retry-after-ms` wins over `retry-after` (seconds).
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
    };

    // out-of-range values are ignored rather than overflowing Duration
    header("retry-after-ms")
        .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
        .or_else(|| header("retry-after").and_then(|s| Duration::try_from_secs_f64(s).ok()))
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) if body.trim().is_empty() => "no error body".to_string(),
        Err(_) => body.trim().chars().take(500).collect(),
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;
    use crate::error::LlmErrorKind;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn rate_limit_reads_retry_after() {
        let err = classify_failure(
            "openai",
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after", "2")]),
            "",
        );
        match err {
            LlmError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn retry_after_ms_preferred() {
        let h = headers(&[("retry-after", "20"), ("retry-after-ms", "250")]);
        assert_eq!(retry_after(&h), Some(Duration::from_millis(250)));
        assert_eq!(retry_after(&headers(&[("retry-after", "soon")])), None);
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn huge_retry_after_is_ignored() {
        assert_eq!(retry_after(&headers(&[("retry-after", "1e30")])), None);
        assert_eq!(retry_after(&headers(&[("retry-after-ms", "1e300")])), None);
        let h = headers(&[("retry-after-ms", "1e300"), ("retry-after", "2")]);
        assert_eq!(retry_after(&h), Some(Duration::from_secs(2)));
    }

    #[test]
    fn status_classes() {
        let empty = HeaderMap::new();
        let kind = |status| classify_failure("p", status, &empty, "").kind();
        assert_eq!(kind(StatusCode::INTERNAL_SERVER_ERROR), LlmErrorKind::ApiError);
        assert_eq!(kind(StatusCode::BAD_GATEWAY), LlmErrorKind::ApiError);
        assert_eq!(kind(StatusCode::GATEWAY_TIMEOUT), LlmErrorKind::Timeout);
        assert_eq!(kind(StatusCode::BAD_REQUEST), LlmErrorKind::InvalidRequest);
        assert_eq!(kind(StatusCode::UNAUTHORIZED), LlmErrorKind::InvalidRequest);
    }

    #[test]
    fn error_body_message_extracted() {
        let body = r#"{"error":{"message":"max_tokens is too large","type":"invalid_request_error"}}"#;
        let err = classify_failure("p", StatusCode::BAD_REQUEST, &HeaderMap::new(), body);
        assert!(err.to_string().contains("max_tokens is too large"));

        let err = classify_failure("p", StatusCode::BAD_GATEWAY, &HeaderMap::new(), "<html>oops</html>");
        assert!(err.to_string().contains("<html>oops</html>"));
    }
}
