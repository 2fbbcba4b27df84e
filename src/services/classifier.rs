//! Image-safety classification.
//!
//! `SafeSearchClient` is the transport seam; `VisionClient` speaks the
//! `images:annotate` SAFE_SEARCH_DETECTION wire format over HTTP.
//! `ContentClassifier` reduces a verdict to offensive / safe against the
//! configured likelihood threshold.

use crate::models::verdict::{ClassificationVerdict, Likelihood};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("classification request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classification service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("classification service error {code}: {message}")]
    Service { code: i64, message: String },
    #[error("malformed classification response: {0}")]
    MalformedResponse(String),
}

/// What the classifier should look at.
#[derive(Clone, Debug)]
pub enum ImageSource {
    /// Object URI the service can fetch itself, e.g. `gs://bucket/path`.
    Uri(String),
    /// Raw encoded image bytes sent inline.
    Content(Bytes),
}

#[async_trait]
pub trait SafeSearchClient: Send + Sync + 'static {
    async fn detect_safe_search(
        &self,
        image: &ImageSource,
    ) -> Result<ClassificationVerdict, ClassificationError>;
}

/// True iff either likelihood reaches `threshold`.
pub fn is_offensive(verdict: &ClassificationVerdict, threshold: Likelihood) -> bool {
    verdict.adult >= threshold || verdict.violence >= threshold
}

#[derive(Clone)]
pub struct ContentClassifier {
    client: Arc<dyn SafeSearchClient>,
    threshold: Likelihood,
}

impl ContentClassifier {
    pub fn new(client: Arc<dyn SafeSearchClient>, threshold: Likelihood) -> Self {
        Self { client, threshold }
    }

    pub fn threshold(&self) -> Likelihood {
        self.threshold
    }

    /// Errors propagate unchanged; a failed call is never read as "safe".
    pub async fn classify(
        &self,
        image: &ImageSource,
    ) -> Result<ClassificationVerdict, ClassificationError> {
        self.client.detect_safe_search(image).await
    }

    pub fn is_offensive(&self, verdict: &ClassificationVerdict) -> bool {
        is_offensive(verdict, self.threshold)
    }
}

/// HTTP client for a Vision-compatible `images:annotate` endpoint.
pub struct VisionClient {
    endpoint: String,
    api_key: Option<String>,
    http_client: Client,
}

impl VisionClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ClassificationError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    fn request_body(image: &ImageSource) -> serde_json::Value {
        let image = match image {
            ImageSource::Uri(uri) => json!({ "source": { "imageUri": uri } }),
            ImageSource::Content(bytes) => {
                json!({ "content": general_purpose::STANDARD.encode(bytes) })
            }
        };
        json!({
            "requests": [{
                "image": image,
                "features": [{ "type": "SAFE_SEARCH_DETECTION" }]
            }]
        })
    }
}

#[async_trait]
impl SafeSearchClient for VisionClient {
    async fn detect_safe_search(
        &self,
        image: &ImageSource,
    ) -> Result<ClassificationVerdict, ClassificationError> {
        let url = format!("{}/v1/images:annotate", self.endpoint);
        let mut request = self.http_client.post(&url).json(&Self::request_body(image));
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key)]);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClassificationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let verdict = parse_annotate_response(&body)?;
        debug!(adult = %verdict.adult, violence = %verdict.violence, "safe search verdict");
        Ok(verdict)
    }
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    safe_search_annotation: Option<SafeSearchAnnotation>,
    error: Option<RpcStatus>,
}

#[derive(Deserialize)]
struct SafeSearchAnnotation {
    #[serde(default = "unknown")]
    adult: Likelihood,
    #[serde(default = "unknown")]
    violence: Likelihood,
}

#[derive(Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

fn unknown() -> Likelihood {
    Likelihood::Unknown
}

/// Reduce an `images:annotate` response body to a verdict.
pub fn parse_annotate_response(body: &str) -> Result<ClassificationVerdict, ClassificationError> {
    let parsed: AnnotateResponse = serde_json::from_str(body)
        .map_err(|e| ClassificationError::MalformedResponse(e.to_string()))?;

    let first = parsed
        .responses
        .into_iter()
        .next()
        .ok_or_else(|| ClassificationError::MalformedResponse("empty responses".into()))?;

    if let Some(err) = first.error {
        return Err(ClassificationError::Service {
            code: err.code,
            message: err.message,
        });
    }

    let annotation = first.safe_search_annotation.ok_or_else(|| {
        ClassificationError::MalformedResponse("missing safeSearchAnnotation".into())
    })?;

    Ok(ClassificationVerdict {
        adult: annotation.adult,
        violence: annotation.violence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(adult: u8, violence: u8) -> ClassificationVerdict {
        ClassificationVerdict {
            adult: Likelihood::from_ordinal(adult).unwrap(),
            violence: Likelihood::from_ordinal(violence).unwrap(),
        }
    }

    #[test]
    fn offensive_when_either_axis_reaches_threshold() {
        assert!(is_offensive(&verdict(4, 0), Likelihood::Likely));
        assert!(is_offensive(&verdict(0, 5), Likelihood::Likely));
        assert!(!is_offensive(&verdict(3, 3), Likelihood::Likely));
    }

    #[test]
    fn tighter_threshold_flags_more_images() {
        assert!(is_offensive(&verdict(3, 0), Likelihood::Possible));
        assert!(!is_offensive(&verdict(2, 2), Likelihood::Possible));
    }

    #[test]
    fn parses_safe_search_annotation() {
        let body = r#"{"responses":[{"safeSearchAnnotation":{
            "adult":"VERY_LIKELY","spoof":"UNLIKELY","medical":"UNLIKELY",
            "violence":"POSSIBLE","racy":"LIKELY"}}]}"#;
        let v = parse_annotate_response(body).unwrap();
        assert_eq!(v.adult, Likelihood::VeryLikely);
        assert_eq!(v.violence, Likelihood::Possible);
    }

    #[test]
    fn per_image_error_is_a_failure_not_a_safe_verdict() {
        let body = r#"{"responses":[{"error":{"code":7,"message":"quota exceeded"}}]}"#;
        let err = parse_annotate_response(body).unwrap_err();
        assert!(matches!(err, ClassificationError::Service { code: 7, .. }));
    }

    #[test]
    fn missing_annotation_is_malformed() {
        assert!(matches!(
            parse_annotate_response(r#"{"responses":[{}]}"#).unwrap_err(),
            ClassificationError::MalformedResponse(_)
        ));
        assert!(matches!(
            parse_annotate_response(r#"{"responses":[]}"#).unwrap_err(),
            ClassificationError::MalformedResponse(_)
        ));
        assert!(matches!(
            parse_annotate_response("not json").unwrap_err(),
            ClassificationError::MalformedResponse(_)
        ));
    }

    #[test]
    fn request_body_inlines_content_as_base64() {
        let body = VisionClient::request_body(&ImageSource::Content(Bytes::from_static(b"abc")));
        assert_eq!(body["requests"][0]["image"]["content"], "YWJj");
        assert_eq!(
            body["requests"][0]["features"][0]["type"],
            "SAFE_SEARCH_DETECTION"
        );

        let body = VisionClient::request_body(&ImageSource::Uri("gs://b/p.png".into()));
        assert_eq!(body["requests"][0]["image"]["source"]["imageUri"], "gs://b/p.png");
    }
}
