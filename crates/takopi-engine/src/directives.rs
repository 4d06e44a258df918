//! In-message directives and the context header line.
//!
//! A message may start with any mix of `/engine`, `/project` and `@branch`
//! tokens; the first token that is none of these begins the prompt.
//! Progress messages carry a canonical first line of the form
//! `` `project @branch` `` which `parse_context_line` reconstructs from
//! reply text.

use takopi_core::config::ProjectsConfig;
use takopi_core::context::RunContext;
use takopi_core::error::{Result, TakopiError};
use takopi_core::model::EngineId;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directives {
    pub engine: Option<EngineId>,
    pub project: Option<String>,
    pub branch: Option<String>,
    pub prompt: String,
}

/// Parse leading directives off `text`. `/word` is matched case-insensitively
/// against engine ids first, then project aliases; anything else is a hard
/// error so typos do not silently become prompts.
pub fn parse_directives(
    text: &str,
    engine_ids: &[EngineId],
    projects: &ProjectsConfig,
) -> Result<Directives> {
    let mut directives = Directives::default();
    let mut rest = text;

    loop {
        let trimmed = rest.trim_start();
        let Some(token) = trimmed.split_whitespace().next() else {
            rest = trimmed;
            break;
        };

        if let Some(word) = token.strip_prefix('/') {
            // `/cmd@botname` arrives from group chats.
            let word = word.split('@').next().unwrap_or(word);
            if word.is_empty() {
                break;
            }
            let key = word.to_lowercase();
            if engine_ids.iter().any(|e| *e == key) {
                if directives.engine.is_some() {
                    return Err(TakopiError::Directive(format!(
                        "duplicate engine directive /{word}."
                    )));
                }
                directives.engine = Some(key);
            } else if let Some(project_key) = projects.normalize_key(&key) {
                if directives.project.is_some() {
                    return Err(TakopiError::Directive(format!(
                        "duplicate project directive /{word}."
                    )));
                }
                directives.project = Some(project_key);
            } else {
                return Err(TakopiError::Directive(format!(
                    "unknown engine or project /{word}."
                )));
            }
        } else if let Some(branch) = token.strip_prefix('@') {
            if branch.is_empty() {
                return Err(TakopiError::Directive("empty @branch directive.".into()));
            }
            if directives.branch.is_some() {
                return Err(TakopiError::Directive(format!(
                    "duplicate branch directive @{branch}."
                )));
            }
            directives.branch = Some(branch.to_string());
        } else {
            rest = trimmed;
            break;
        }

        rest = &trimmed[token.len()..];
    }

    directives.prompt = rest.trim().to_string();
    Ok(directives)
}

/// Render the canonical context header for progress messages.
pub fn format_context_line(
    context: Option<&RunContext>,
    projects: &ProjectsConfig,
) -> Option<String> {
    let context = context?;
    let project = context
        .project
        .as_deref()
        .map(|key| projects.alias_for_key(key));
    let line = match (project, context.branch.as_deref()) {
        (Some(project), Some(branch)) => format!("`{project} @{branch}`"),
        (Some(project), None) => format!("`{project}`"),
        (None, Some(branch)) => format!("`@{branch}`"),
        (None, None) => return None,
    };
    Some(line)
}

/// Reconstruct a context from the first line of reply text, if that line is
/// a canonical context header. Unknown project names do not match; a reply
/// quoting unrelated code must not conjure a context.
pub fn parse_context_line(
    reply_text: Option<&str>,
    projects: &ProjectsConfig,
) -> Option<RunContext> {
    let first_line = reply_text?.lines().next()?.trim();
    let stripped = first_line.trim_matches('`').trim();
    let tokens: Vec<&str> = stripped.split_whitespace().collect();
    match tokens.as_slice() {
        [project] if !project.starts_with('@') => {
            let key = projects.normalize_key(project)?;
            Some(RunContext {
                project: Some(key),
                branch: None,
            })
        }
        [branch] => {
            let branch = branch.strip_prefix('@')?;
            (!branch.is_empty()).then(|| RunContext {
                project: None,
                branch: Some(branch.to_string()),
            })
        }
        [project, branch] if branch.starts_with('@') => {
            let key = projects.normalize_key(project)?;
            let branch = &branch[1..];
            (!branch.is_empty()).then(|| RunContext {
                project: Some(key),
                branch: Some(branch.to_string()),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use takopi_core::config::ProjectConfig;

    fn projects() -> ProjectsConfig {
        let mut map = HashMap::new();
        map.insert(
            "myproj".to_string(),
            ProjectConfig {
                alias: "MyProj".into(),
                path: "/tmp/repo".into(),
                worktrees_dir: ".worktrees".into(),
                worktree_base: None,
                default_engine: None,
                chat_id: None,
            },
        );
        ProjectsConfig {
            projects: map,
            default_project: None,
            chat_map: HashMap::new(),
        }
    }

    fn engines() -> Vec<EngineId> {
        vec!["codex".into(), "claude".into()]
    }

    #[test]
    fn parses_engine_project_branch_prefix() {
        let d = parse_directives(
            "/codex /myproj @feat write README",
            &engines(),
            &projects(),
        )
        .unwrap();
        assert_eq!(d.engine.as_deref(), Some("codex"));
        assert_eq!(d.project.as_deref(), Some("myproj"));
        assert_eq!(d.branch.as_deref(), Some("feat"));
        assert_eq!(d.prompt, "write README");
    }

    #[test]
    fn first_non_directive_token_starts_prompt() {
        let d = parse_directives("/codex fix the /myproj bug", &engines(), &projects()).unwrap();
        assert_eq!(d.engine.as_deref(), Some("codex"));
        assert_eq!(d.project, None);
        assert_eq!(d.prompt, "fix the /myproj bug");
    }

    #[test]
    fn directive_order_is_free() {
        let d = parse_directives("@feat /codex go", &engines(), &projects()).unwrap();
        assert_eq!(d.branch.as_deref(), Some("feat"));
        assert_eq!(d.engine.as_deref(), Some("codex"));
        assert_eq!(d.prompt, "go");
    }

    #[test]
    fn unknown_slash_word_is_error() {
        let err = parse_directives("/nope hello", &engines(), &projects()).unwrap_err();
        assert!(err.to_string().contains("unknown engine or project"));
    }

    #[test]
    fn bot_mention_suffix_is_stripped() {
        let d = parse_directives("/codex@takopi_bot hi", &engines(), &projects()).unwrap();
        assert_eq!(d.engine.as_deref(), Some("codex"));
        assert_eq!(d.prompt, "hi");
    }

    #[test]
    fn case_insensitive_matching() {
        let d = parse_directives("/Codex /MYPROJ go", &engines(), &projects()).unwrap();
        assert_eq!(d.engine.as_deref(), Some("codex"));
        assert_eq!(d.project.as_deref(), Some("myproj"));
    }

    #[test]
    fn empty_prompt_is_allowed() {
        let d = parse_directives("/myproj", &engines(), &projects()).unwrap();
        assert_eq!(d.project.as_deref(), Some("myproj"));
        assert_eq!(d.prompt, "");
    }

    #[test]
    fn multiline_prompt_preserved() {
        let d = parse_directives("/codex line one\nline two", &engines(), &projects()).unwrap();
        assert_eq!(d.prompt, "line one\nline two");
    }

    #[test]
    fn context_line_round_trip() {
        let projects = projects();
        let ctx = RunContext {
            project: Some("myproj".into()),
            branch: Some("feat".into()),
        };
        let line = format_context_line(Some(&ctx), &projects).unwrap();
        assert_eq!(line, "`MyProj @feat`");
        let reply = format!("{line}\nworking · 3s");
        let parsed = parse_context_line(Some(&reply), &projects).unwrap();
        assert_eq!(parsed.project.as_deref(), Some("myproj"));
        assert_eq!(parsed.branch.as_deref(), Some("feat"));
    }

    #[test]
    fn context_line_branch_only() {
        let projects = projects();
        let parsed = parse_context_line(Some("`@feat`\nrest"), &projects).unwrap();
        assert_eq!(parsed.project, None);
        assert_eq!(parsed.branch.as_deref(), Some("feat"));
    }

    #[test]
    fn context_line_unknown_project_does_not_match() {
        let projects = projects();
        assert_eq!(parse_context_line(Some("`other @x`"), &projects), None);
        assert_eq!(parse_context_line(Some("hello there"), &projects), None);
        assert_eq!(parse_context_line(None, &projects), None);
    }
}
