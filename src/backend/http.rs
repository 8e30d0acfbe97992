//! REST provisioning backend
//!
//! Routes, relative to the endpoint:
//!
//! | Call       | Request                                  | Success body      |
//! |------------|------------------------------------------|-------------------|
//! | `validate` | `POST /v1/validate`                      | ignored           |
//! | `create`   | `POST /v1/resources/{kind}`              | `{"id": "..."}`   |
//! | `describe` | `GET /v1/resources/{kind}/{id}`          | an [`Observation`]|
//! | `update`   | `PUT /v1/resources/{kind}/{id}`          | ignored           |
//! | `delete`   | `DELETE /v1/resources/{kind}/{id}`       | ignored           |
//!
//! 4xx responses are rejections carrying the server's message verbatim;
//! 404 on `describe` means the object is gone. 5xx responses, 408, 429 and
//! transport failures are transient.

use declarative::{Observation, Provider, ProviderError, ProviderResult, ResolvedSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use ureq::Agent;

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP provisioning backend
pub struct HttpProvider {
    agent: Agent,
    endpoint: String,
    region: String,
}

#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    logical_id: &'a str,
    kind: &'a str,
    region: &'a str,
    properties: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CreateReply {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    #[serde(default, alias = "error")]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Status and body of a response
struct Reply {
    status: u16,
    body: String,
}

impl Reply {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl HttpProvider {
    pub fn new(endpoint: &str, region: &str) -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        Self {
            agent: Agent::new_with_config(config),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            region: region.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn validate_url(&self) -> String {
        format!("{}/v1/validate", self.endpoint)
    }

    fn collection_url(&self, kind: &str) -> String {
        format!("{}/v1/resources/{kind}", self.endpoint)
    }

    fn object_url(&self, kind: &str, remote_id: &str) -> String {
        format!("{}/v1/resources/{kind}/{remote_id}", self.endpoint)
    }

    fn body<'a>(&'a self, spec: &'a ResolvedSpec) -> RequestBody<'a> {
        RequestBody {
            logical_id: &spec.logical_id,
            kind: &spec.kind,
            region: &self.region,
            properties: &spec.properties,
        }
    }
}

/// Read a response, mapping transport failures to transient errors
fn receive(
    url: &str,
    result: Result<ureq::http::Response<ureq::Body>, ureq::Error>,
) -> ProviderResult<Reply> {
    let mut response = result.map_err(|e| ProviderError::transient(format!("{url}: {e}")))?;
    let status = response.status().as_u16();
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| ProviderError::transient(format!("{url}: {e}")))?;
    log::trace!("{url} -> {status}");
    Ok(Reply { status, body })
}

/// Extract the server's message, falling back to the raw body
fn error_message(reply: &Reply) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorReply>(&reply.body)
        && let Some(message) = parsed.message
    {
        return message;
    }
    let raw = reply.body.trim();
    if raw.is_empty() {
        format!("HTTP {}", reply.status)
    } else {
        raw.to_string()
    }
}

/// Map a non-success reply to a provider error
fn classify(reply: &Reply, remote_id: Option<&str>) -> ProviderError {
    match reply.status {
        404 if remote_id.is_some() => ProviderError::NotFound {
            remote_id: remote_id.unwrap_or_default().to_string(),
        },
        408 | 429 | 500..=599 => ProviderError::transient(error_message(reply)),
        400..=499 => {
            if let Ok(parsed) = serde_json::from_str::<ErrorReply>(&reply.body)
                && !parsed.errors.is_empty()
            {
                return ProviderError::Invalid {
                    errors: parsed.errors,
                };
            }
            ProviderError::rejected(error_message(reply))
        }
        status => ProviderError::Other(format!("unexpected HTTP {status}: {}", error_message(reply))),
    }
}

fn expect_success(reply: &Reply, remote_id: Option<&str>) -> ProviderResult<()> {
    if reply.is_success() {
        Ok(())
    } else {
        Err(classify(reply, remote_id))
    }
}

fn parse<T: for<'de> Deserialize<'de>>(url: &str, reply: &Reply) -> ProviderResult<T> {
    serde_json::from_str(&reply.body)
        .map_err(|e| ProviderError::Other(format!("{url}: malformed response: {e}")))
}

impl Provider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn validate(&self, spec: &ResolvedSpec) -> ProviderResult<()> {
        let url = self.validate_url();
        let reply = receive(&url, self.agent.post(&url).send_json(self.body(spec)))?;
        expect_success(&reply, None)
    }

    fn create(&self, spec: &ResolvedSpec) -> ProviderResult<String> {
        let url = self.collection_url(&spec.kind);
        let reply = receive(&url, self.agent.post(&url).send_json(self.body(spec)))?;
        expect_success(&reply, None)?;
        let created: CreateReply = parse(&url, &reply)?;
        Ok(created.id)
    }

    fn describe(&self, kind: &str, remote_id: &str) -> ProviderResult<Observation> {
        let url = self.object_url(kind, remote_id);
        let reply = receive(&url, self.agent.get(&url).call())?;
        if reply.status == 404 {
            return Ok(Observation::gone());
        }
        expect_success(&reply, Some(remote_id))?;
        parse(&url, &reply)
    }

    fn update(&self, remote_id: &str, spec: &ResolvedSpec) -> ProviderResult<()> {
        let url = self.object_url(&spec.kind, remote_id);
        let reply = receive(&url, self.agent.put(&url).send_json(self.body(spec)))?;
        expect_success(&reply, Some(remote_id))
    }

    fn delete(&self, kind: &str, remote_id: &str) -> ProviderResult<()> {
        let url = self.object_url(kind, remote_id);
        let reply = receive(&url, self.agent.delete(&url).call())?;
        expect_success(&reply, Some(remote_id))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::ErrorCategory;

    fn reply(status: u16, body: &str) -> Reply {
        Reply {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn urls_are_built_from_the_endpoint() {
        let provider = HttpProvider::new("http://api.example/", "eu-west-1");
        assert_eq!(provider.endpoint(), "http://api.example");
        assert_eq!(provider.validate_url(), "http://api.example/v1/validate");
        assert_eq!(
            provider.collection_url("subnet"),
            "http://api.example/v1/resources/subnet"
        );
        assert_eq!(
            provider.object_url("subnet", "subnet-1"),
            "http://api.example/v1/resources/subnet/subnet-1"
        );
    }

    #[test]
    fn request_body_carries_region() {
        let provider = HttpProvider::new("http://api.example", "eu-west-1");
        let spec = ResolvedSpec {
            logical_id: "vpc".into(),
            kind: "network".into(),
            properties: BTreeMap::from([("cidr_block".to_string(), "10.0.0.0/16".into())]),
        };
        let json = serde_json::to_value(provider.body(&spec)).unwrap();
        assert_eq!(json["region"], "eu-west-1");
        assert_eq!(json["properties"]["cidr_block"], "10.0.0.0/16");
    }

    #[test]
    fn client_errors_keep_the_server_message() {
        let err = classify(&reply(403, r#"{"message": "quota exceeded for instances"}"#), None);
        assert_eq!(err, ProviderError::rejected("quota exceeded for instances"));

        let err = classify(&reply(400, "  bad cidr  "), None);
        assert_eq!(err.to_string(), "bad cidr");

        let err = classify(&reply(409, ""), None);
        assert_eq!(err.to_string(), "HTTP 409");
    }

    #[test]
    fn validation_errors_are_listed() {
        let err = classify(
            &reply(422, r#"{"errors": ["cidr_block is required", "tags must be a map"]}"#),
            None,
        );
        assert_eq!(
            err,
            ProviderError::Invalid {
                errors: vec!["cidr_block is required".into(), "tags must be a map".into()]
            }
        );
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 502, 503, 408, 429] {
            let err = classify(&reply(status, r#"{"error": "try later"}"#), None);
            assert_eq!(err.category(), ErrorCategory::Transient, "status {status}");
        }
    }

    #[test]
    fn not_found_names_the_object() {
        let err = classify(&reply(404, ""), Some("i-123"));
        assert_eq!(
            err,
            ProviderError::NotFound {
                remote_id: "i-123".into()
            }
        );
        let err = classify(&reply(404, "no such kind"), None);
        assert_eq!(err.category(), ErrorCategory::Rejected);
    }

    #[test]
    fn malformed_success_body_is_reported() {
        let err = parse::<CreateReply>("http://x", &reply(201, "not json")).unwrap_err();
        assert!(err.to_string().contains("malformed response"));
    }
}
