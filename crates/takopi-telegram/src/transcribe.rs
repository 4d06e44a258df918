//! Voice-note transcription via the OpenAI audio API.

use reqwest::multipart::{Form, Part};
use tracing::warn;

pub const TRANSCRIPTION_MODEL: &str = "gpt-4o-mini-transcribe";
pub const AUDIO_MAX_BYTES: u64 = 25 * 1024 * 1024;
const TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// `OPENAI_API_KEY`, trimmed, or `None` when unset/empty.
pub fn resolve_openai_api_key() -> Option<String> {
    let key = std::env::var("OPENAI_API_KEY").ok()?;
    let key = key.trim();
    (!key.is_empty()).then(|| key.to_string())
}

/// Telegram hands voice notes out as `.oga`; the transcription endpoint
/// only accepts the `.ogg` spelling of the same container.
pub fn normalize_voice_filename(file_path: Option<&str>, mime_type: Option<&str>) -> String {
    let name = file_path
        .and_then(|p| std::path::Path::new(p).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.is_empty() {
        return if mime_type == Some("audio/ogg") {
            "voice.ogg".to_string()
        } else {
            "voice.dat".to_string()
        };
    }
    match name.strip_suffix(".oga") {
        Some(stem) => format!("{stem}.ogg"),
        None => name,
    }
}

/// Transcribe audio bytes; `None` on any failure (logged).
pub async fn transcribe_audio(
    audio: Vec<u8>,
    filename: &str,
    api_key: &str,
    mime_type: Option<&str>,
) -> Option<String> {
    let mut part = Part::bytes(audio).file_name(filename.to_string());
    if let Some(mime) = mime_type {
        part = match part.mime_str(mime) {
            Ok(part) => part,
            Err(e) => {
                warn!(error = %e, mime, "invalid audio mime type");
                return None;
            }
        };
    }
    let form = Form::new()
        .text("model", TRANSCRIPTION_MODEL)
        .text("chunking_strategy", "auto")
        .part("file", part);

    let result = async {
        let response = reqwest::Client::new()
            .post(TRANSCRIPTION_URL)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        response.json::<serde_json::Value>().await
    }
    .await;

    match result {
        Ok(body) => body
            .get("text")
            .and_then(|t| t.as_str())
            .map(str::to_string),
        Err(e) => {
            warn!(error = %e, "transcription request failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_normalisation() {
        assert_eq!(
            normalize_voice_filename(Some("voice/file_1.oga"), None),
            "file_1.ogg"
        );
        assert_eq!(
            normalize_voice_filename(Some("clip.mp3"), None),
            "clip.mp3"
        );
        assert_eq!(
            normalize_voice_filename(None, Some("audio/ogg")),
            "voice.ogg"
        );
        assert_eq!(normalize_voice_filename(None, None), "voice.dat");
    }
}
