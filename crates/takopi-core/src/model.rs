use serde::{Deserialize, Serialize};

/// Identifier of an engine backend (`"codex"`, `"claude"`, ...).
///
/// Compared case-insensitively where user input is involved; stored lowercase.
pub type EngineId = String;

/// Opaque resume token minted by an engine.
///
/// Presenting the token on a later run continues the prior engine session.
/// Tokens are engine-qualified: the same `value` under two engines names two
/// unrelated sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken {
    pub engine: EngineId,
    pub value: String,
}

impl ResumeToken {
    pub fn new(engine: impl Into<EngineId>, value: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            value: value.into(),
        }
    }

    /// Stable key identifying the engine session this token belongs to.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.engine, self.value)
    }
}

/// Opaque handle to a message the transport has sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: i64,
    pub message_id: i64,
}

impl MessageRef {
    pub fn new(channel_id: i64, message_id: i64) -> Self {
        Self {
            channel_id,
            message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_is_engine_qualified() {
        let a = ResumeToken::new("codex", "abc");
        let b = ResumeToken::new("claude", "abc");
        assert_ne!(a.session_key(), b.session_key());
    }

    #[test]
    fn message_ref_hash_equality() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(MessageRef::new(10, 5), "run");
        assert_eq!(map.get(&MessageRef::new(10, 5)), Some(&"run"));
        assert_eq!(map.get(&MessageRef::new(10, 6)), None);
    }
}
