/// Command ids the bot claims for itself. Plugins and project aliases must
/// not shadow these.
pub const RESERVED_COMMAND_IDS: &[&str] = &["cancel", "ctx", "new", "topic", "file"];

/// Telegram bot command ids: 1-32 chars of lowercase letters, digits and
/// underscores. We additionally allow `-` in project aliases and strip it
/// when publishing the menu is not possible.
pub fn is_valid_id(id: &str) -> bool {
    if id.is_empty() || id.len() > 32 {
        return false;
    }
    id.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

pub fn is_reserved(id: &str) -> bool {
    RESERVED_COMMAND_IDS
        .iter()
        .any(|r| r.eq_ignore_ascii_case(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        assert!(is_valid_id("codex"));
        assert!(is_valid_id("my_proj-2"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("Has Upper"));
        assert!(!is_valid_id(&"x".repeat(33)));
    }

    #[test]
    fn reserved_is_case_insensitive() {
        assert!(is_reserved("cancel"));
        assert!(is_reserved("Cancel"));
        assert!(!is_reserved("run"));
    }
}
