//! Commands the interactive front end sends to the tour backend

use crate::ai::ApiError;
use crate::history::{HistoryItem, HistoryStore, Storage};
use crate::tour::{ChatMessage, TourError, TourGuide, TourResult};
use crate::tts::{AudioOutput, NarrationSession, NarrationStatus};
use std::path::Path;

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    TogglePlayback,
    ResetNarration,
    ListHistory,
    ClearHistory,
    Quit,
    Ask(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "" | "p" => Command::TogglePlayback,
            "r" => Command::ResetNarration,
            "h" => Command::ListHistory,
            "c" => Command::ClearHistory,
            "q" => Command::Quit,
            question => Command::Ask(question.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(String),
    Done,
    Quit,
}

/// Mime type for an uploaded photo, from its file extension.
pub fn image_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

pub fn describe_status(status: NarrationStatus) -> &'static str {
    match status {
        NarrationStatus::Loading => "Preparing narration...",
        NarrationStatus::Playing => "Playing",
        NarrationStatus::Paused => "Paused",
        NarrationStatus::Unavailable => "Audio unavailable",
        NarrationStatus::Finished => "Narration finished",
    }
}

/// Application state
pub struct AppState<O: AudioOutput, S: Storage> {
    pub guide: TourGuide,
    pub session: NarrationSession<O>,
    pub history: HistoryStore<S>,
    pub user: String,
    pub language: String,
    pub current: Option<TourResult>,
    pub chat: Vec<ChatMessage>,
}

impl<O: AudioOutput, S: Storage> AppState<O, S> {
    pub fn new(
        guide: TourGuide,
        session: NarrationSession<O>,
        history: HistoryStore<S>,
        user: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            guide,
            session,
            history,
            user: user.into(),
            language: language.into(),
            current: None,
            chat: Vec::new(),
        }
    }

    /// Identify a photo, record it in history and queue its narration.
    pub async fn scan(&mut self, image: &[u8], mime_type: &str) -> Result<&TourResult, TourError> {
        let result = self.guide.scan(image, mime_type, &self.language).await?;

        let item = HistoryItem::from_result(&result, &self.language, None);
        if let Err(e) = self.history.save(&self.user, item) {
            log::warn!("Could not save history: {}", e);
        }

        self.chat.clear();
        self.session.load(&result.details.text, &self.language);
        Ok(self.current.insert(result))
    }

    pub async fn execute(&mut self, command: Command) -> Result<Outcome, String> {
        match command {
            Command::TogglePlayback => {
                self.session.toggle_playback();
                Ok(Outcome::Reply(describe_status(self.session.status()).to_string()))
            }
            Command::ResetNarration => {
                self.session.reset();
                if let Some(current) = &self.current {
                    self.session.load(&current.details.text, &self.language);
                }
                Ok(Outcome::Done)
            }
            Command::ListHistory => {
                let items = self.history.list(&self.user).map_err(|e| e.to_string())?;
                if items.is_empty() {
                    return Ok(Outcome::Reply("No history yet".to_string()));
                }
                let lines: Vec<String> = items
                    .iter()
                    .map(|i| {
                        format!(
                            "{}  {} ({:.0}%)",
                            i.scanned_at.format("%Y-%m-%d %H:%M"),
                            i.landmark_name,
                            i.confidence * 100.0
                        )
                    })
                    .collect();
                Ok(Outcome::Reply(lines.join("\n")))
            }
            Command::ClearHistory => {
                self.history.clear(&self.user).map_err(|e| e.to_string())?;
                Ok(Outcome::Reply("History cleared".to_string()))
            }
            Command::Quit => {
                self.session.close();
                Ok(Outcome::Quit)
            }
            Command::Ask(question) => {
                let Some(current) = &self.current else {
                    return Err("Scan a landmark first".to_string());
                };
                let reply = self
                    .guide
                    .ask(&current.landmark.name, &mut self.chat, &question, &self.language)
                    .await
                    .map_err(|e: ApiError| e.to_string())?;
                Ok(Outcome::Reply(reply))
            }
        }
    }
}
