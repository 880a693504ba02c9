//! External verification providers
//!
//! Face matching, speech transcription and reference-image retrieval are
//! opaque network services. Each is consumed through a trait so the
//! orchestrator can be exercised against scripted implementations in tests.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use veriflow_common::{Error, Result};

/// Transcription result: recognized text plus the provider's confidence
#[derive(Debug, Clone, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub confidence: f64,
}

/// Compares two face images and returns a similarity score in [0, 1]
#[async_trait]
pub trait FaceMatcher: Send + Sync {
    async fn compare(&self, probe: &[u8], reference: &[u8]) -> Result<f64>;
}

/// Transcribes an audio sample to text
#[async_trait]
pub trait SpeechTranscriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcription>;
}

/// Fetches the enrolled reference image for an owner
#[async_trait]
pub trait ReferenceVault: Send + Sync {
    async fn face_reference(&self, owner_id: &str) -> Result<Vec<u8>>;
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::ExternalService(e.to_string()))
}

fn request_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::ExternalService(format!("{} timed out", context))
    } else {
        Error::ExternalService(format!("{}: {}", context, err))
    }
}

/// HTTP face matching service client
pub struct HttpFaceMatcher {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CompareResponse {
    similarity: f64,
}

impl HttpFaceMatcher {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url,
        })
    }
}

#[async_trait]
impl FaceMatcher for HttpFaceMatcher {
    async fn compare(&self, probe: &[u8], reference: &[u8]) -> Result<f64> {
        let url = format!("{}/v1/compare", self.base_url);
        debug!("Comparing face evidence via {}", url);

        let form = reqwest::multipart::Form::new()
            .part(
                "probe",
                reqwest::multipart::Part::bytes(probe.to_vec()).file_name("probe"),
            )
            .part(
                "reference",
                reqwest::multipart::Part::bytes(reference.to_vec()).file_name("reference"),
            );

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| request_error("face matcher", e))?;

        if !response.status().is_success() {
            return Err(Error::ExternalService(format!(
                "face matcher returned {}",
                response.status()
            )));
        }

        let parsed: CompareResponse = response
            .json()
            .await
            .map_err(|e| request_error("face matcher", e))?;

        Ok(parsed.similarity.clamp(0.0, 1.0))
    }
}

/// HTTP speech-to-text service client
pub struct HttpSpeechTranscriber {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSpeechTranscriber {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url,
        })
    }
}

#[async_trait]
impl SpeechTranscriber for HttpSpeechTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcription> {
        let url = format!("{}/v1/transcribe", self.base_url);
        debug!("Transcribing voice evidence via {}", url);

        let form = reqwest::multipart::Form::new().part(
            "audio",
            reqwest::multipart::Part::bytes(audio.to_vec()).file_name("audio"),
        );

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| request_error("speech transcriber", e))?;

        if !response.status().is_success() {
            return Err(Error::ExternalService(format!(
                "speech transcriber returned {}",
                response.status()
            )));
        }

        let parsed: Transcription = response
            .json()
            .await
            .map_err(|e| request_error("speech transcriber", e))?;

        Ok(Transcription {
            confidence: parsed.confidence.clamp(0.0, 1.0),
            ..parsed
        })
    }
}

/// HTTP client for the reference image vault
pub struct HttpReferenceVault {
    base_url: String,
    client: reqwest::Client,
}

impl HttpReferenceVault {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url,
        })
    }
}

#[async_trait]
impl ReferenceVault for HttpReferenceVault {
    async fn face_reference(&self, owner_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/v1/references/{}/face", self.base_url, owner_id);
        debug!("Fetching reference image from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error("reference vault", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Validation(format!(
                "no enrolled face reference for owner {}",
                owner_id
            )));
        }

        if !response.status().is_success() {
            return Err(Error::ExternalService(format!(
                "reference vault returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error("reference vault", e))?;

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let matcher =
            HttpFaceMatcher::new("http://localhost:9100".to_string(), Duration::from_secs(10))
                .unwrap();
        assert_eq!(matcher.base_url, "http://localhost:9100");

        let transcriber = HttpSpeechTranscriber::new(
            "http://localhost:9101".to_string(),
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(transcriber.base_url, "http://localhost:9101");
    }
}
