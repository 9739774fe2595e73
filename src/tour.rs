//! Tour flow around the narration core: identify a photo, fetch the
//! narration text, keep the guide chat.

use crate::ai::{with_backoff, ApiError, LandmarkService, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TourError {
    #[error("Could not identify the landmark: {0}")]
    Identification(ApiError),
    #[error("Could not load landmark details: {0}")]
    Details(ApiError),
    #[error("No landmark recognized in the photo")]
    NotALandmark,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub name: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkDetails {
    pub text: String,
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TourResult {
    pub landmark: Identification,
    pub details: LandmarkDetails,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Guide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Runs scans and chat against a [`LandmarkService`].
pub struct TourGuide {
    service: Arc<dyn LandmarkService>,
    retry: RetryPolicy,
}

impl TourGuide {
    pub fn new(service: Arc<dyn LandmarkService>, retry: RetryPolicy) -> Self {
        Self { service, retry }
    }

    /// Identify the landmark in `image` and fetch its narration.
    ///
    /// Both calls back off on rate limits and network failures. Any error
    /// left after that is final; the caller starts over with a new scan.
    pub async fn scan(&self, image: &[u8], mime_type: &str, language: &str) -> Result<TourResult, TourError> {
        let landmark = with_backoff(self.retry, "identify", || {
            self.service.identify(image, mime_type, language)
        })
        .await
        .map_err(TourError::Identification)?;

        if landmark.name.is_empty() {
            return Err(TourError::NotALandmark);
        }
        log::info!(
            "Identified {} ({:.0}% confidence)",
            landmark.name,
            landmark.confidence * 100.0
        );

        let details = with_backoff(self.retry, "details", || {
            self.service.details(&landmark.name, language)
        })
        .await
        .map_err(TourError::Details)?;

        Ok(TourResult { landmark, details })
    }

    /// Ask the guide a question and record both sides in `history`.
    ///
    /// Chat is not retried; a failed question leaves `history` untouched.
    pub async fn ask(
        &self,
        landmark: &str,
        history: &mut Vec<ChatMessage>,
        question: &str,
        language: &str,
    ) -> Result<String, ApiError> {
        let reply = self.service.chat(landmark, history, question, language).await?;
        history.push(ChatMessage::new(Sender::User, question));
        history.push(ChatMessage::new(Sender::Guide, reply.clone()));
        Ok(reply)
    }
}
