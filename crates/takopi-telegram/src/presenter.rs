//! Rendering of progress snapshots into wire messages.

use serde_json::json;

use takopi_core::transport::RenderedMessage;
use takopi_engine::progress::{render_final_text, render_progress_text, ProgressState};

use crate::render::{entities_json, prepare_telegram};

pub const CANCEL_CALLBACK_DATA: &str = "takopi:cancel";

pub fn cancel_markup() -> serde_json::Value {
    json!({
        "inline_keyboard": [[{"text": "cancel", "callback_data": CANCEL_CALLBACK_DATA}]]
    })
}

pub fn clear_markup() -> serde_json::Value {
    json!({"inline_keyboard": []})
}

/// Stateless: turns a [`ProgressState`] snapshot into text, entities and
/// reply markup.
#[derive(Default, Clone)]
pub struct TelegramPresenter;

impl TelegramPresenter {
    pub fn render_progress(
        &self,
        state: &ProgressState,
        elapsed_s: f64,
        label: &str,
    ) -> RenderedMessage {
        let body = render_progress_text(state, elapsed_s, label);
        let (text, entities) = prepare_telegram(&body);
        let markup = if label == "cancelled" {
            clear_markup()
        } else {
            cancel_markup()
        };
        RenderedMessage::text(text)
            .with_extra("entities", entities_json(&entities))
            .with_extra("reply_markup", markup)
    }

    pub fn render_final(
        &self,
        state: &ProgressState,
        elapsed_s: f64,
        status: &str,
        answer: &str,
    ) -> RenderedMessage {
        let body = render_final_text(state, elapsed_s, status, answer);
        let (text, entities) = prepare_telegram(&body);
        RenderedMessage::text(text)
            .with_extra("entities", entities_json(&entities))
            .with_extra("reply_markup", clear_markup())
    }
}

/// Plain text reply (errors, usage hints, confirmations).
pub fn render_plain(text: &str) -> RenderedMessage {
    let (text, entities) = prepare_telegram(text);
    RenderedMessage::text(text).with_extra("entities", entities_json(&entities))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_has_cancel_button() {
        let presenter = TelegramPresenter;
        let state = ProgressState {
            engine: "codex".into(),
            recent_actions: vec!["▸ `cargo test`".into()],
            step_count: 1,
            ..Default::default()
        };
        let message = presenter.render_progress(&state, 3.0, "working");
        let markup = message.extra.get("reply_markup").unwrap();
        assert_eq!(
            markup["inline_keyboard"][0][0]["callback_data"],
            CANCEL_CALLBACK_DATA
        );
        assert!(message.text.contains("working · 3s · step 1"));
    }

    #[test]
    fn cancelled_progress_clears_markup() {
        let presenter = TelegramPresenter;
        let state = ProgressState::default();
        let message = presenter.render_progress(&state, 3.0, "cancelled");
        let markup = message.extra.get("reply_markup").unwrap();
        assert!(markup["inline_keyboard"].as_array().unwrap().is_empty());
    }

    #[test]
    fn final_clears_markup_and_carries_answer() {
        let presenter = TelegramPresenter;
        let state = ProgressState::default();
        let message = presenter.render_final(&state, 61.0, "done", "all good");
        assert!(message.text.contains("done · 1m 01s"));
        assert!(message.text.contains("all good"));
        let markup = message.extra.get("reply_markup").unwrap();
        assert!(markup["inline_keyboard"].as_array().unwrap().is_empty());
    }
}
