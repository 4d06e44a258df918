//! Forum-topic bindings: `/ctx`, `/new`, `/topic`.
//!
//! A topic can be bound to a `(project, branch)` context; messages in the
//! thread then run in that context without directives, and each engine's
//! newest resume token is remembered per thread.

use std::collections::HashSet;

use tracing::warn;

use takopi_core::commands::split_command_args;
use takopi_core::config::TopicsScope;
use takopi_core::context::RunContext;
use takopi_core::error::{Result, TakopiError};

use crate::bridge::BridgeShared;
use crate::types::TelegramIncomingMessage;

fn resolve_scope(shared: &BridgeShared) -> (TopicsScope, HashSet<i64>) {
    let project_ids: HashSet<i64> = shared.runtime().project_chat_ids().into_iter().collect();
    let scope = match shared.cfg.topics.scope {
        TopicsScope::Auto if project_ids.is_empty() => TopicsScope::Main,
        TopicsScope::Auto => TopicsScope::Projects,
        other => other,
    };
    let chat_ids = match scope {
        TopicsScope::Main => HashSet::from([shared.cfg.chat_id]),
        TopicsScope::Projects => project_ids,
        TopicsScope::All => {
            let mut ids = project_ids;
            ids.insert(shared.cfg.chat_id);
            ids
        }
        TopicsScope::Auto => unreachable!("auto resolved above"),
    };
    (scope, chat_ids)
}

pub(crate) fn scope_label(shared: &BridgeShared) -> String {
    let (resolved, _) = resolve_scope(shared);
    let name = match resolved {
        TopicsScope::Main => "main",
        TopicsScope::Projects => "projects",
        TopicsScope::All => "all",
        TopicsScope::Auto => "auto",
    };
    if shared.cfg.topics.scope == TopicsScope::Auto {
        format!("auto ({name})")
    } else {
        name.to_string()
    }
}

pub(crate) fn chat_allowed(shared: &BridgeShared, chat_id: i64) -> bool {
    if !shared.cfg.topics.enabled {
        return false;
    }
    let (_, chat_ids) = resolve_scope(shared);
    chat_ids.contains(&chat_id)
}

fn command_error(shared: &BridgeShared, chat_id: i64) -> Option<String> {
    if chat_allowed(shared, chat_id) {
        return None;
    }
    let (resolved, _) = resolve_scope(shared);
    let auto = shared.cfg.topics.scope == TopicsScope::Auto;
    Some(match resolved {
        TopicsScope::Main if auto => {
            "topics commands are only available in the main chat (auto scope). \
             to use topics in project chats, set `topics.scope = \"projects\"`."
                .to_string()
        }
        TopicsScope::Main => "topics commands are only available in the main chat.".to_string(),
        TopicsScope::Projects if auto => {
            "topics commands are only available in project chats (auto scope). \
             to use topics in the main chat, set `topics.scope = \"main\"`."
                .to_string()
        }
        TopicsScope::Projects => {
            "topics commands are only available in project chats.".to_string()
        }
        _ => "topics commands are only available in the main or project chats.".to_string(),
    })
}

/// The chat's own project, when this chat is a project chat.
pub(crate) fn chat_project(shared: &BridgeShared, chat_id: i64) -> Option<String> {
    shared
        .runtime()
        .default_context_for_chat(Some(chat_id))
        .and_then(|ctx| ctx.project)
}

/// A project chat's project underlies whatever the topic bound explicitly.
pub(crate) fn merge_topic_context(
    chat_project: Option<&str>,
    bound: Option<RunContext>,
) -> Option<RunContext> {
    let Some(chat_project) = chat_project else {
        return bound;
    };
    match bound {
        None => Some(RunContext::project(chat_project)),
        Some(bound) if bound.project.is_none() => Some(RunContext {
            project: Some(chat_project.to_string()),
            branch: bound.branch,
        }),
        Some(bound) => Some(bound),
    }
}

pub(crate) fn topic_key(
    shared: &BridgeShared,
    msg: &TelegramIncomingMessage,
) -> Option<(i64, i64)> {
    topic_key_for(shared, msg.chat_id, msg.thread_id)
}

pub(crate) fn topic_key_for(
    shared: &BridgeShared,
    chat_id: i64,
    thread_id: Option<i64>,
) -> Option<(i64, i64)> {
    if shared.topic_store.is_none() || !chat_allowed(shared, chat_id) {
        return None;
    }
    thread_id.map(|thread_id| (chat_id, thread_id))
}

pub(crate) fn usage_ctx_set(chat_project: Option<&str>) -> String {
    if chat_project.is_some() {
        "usage: `/ctx set [@branch]`".to_string()
    } else {
        "usage: `/ctx set <project> [@branch]`".to_string()
    }
}

pub(crate) fn usage_topic(chat_project: Option<&str>) -> String {
    if chat_project.is_some() {
        "usage: `/topic @branch`".to_string()
    } else {
        "usage: `/topic <project> @branch`".to_string()
    }
}

pub(crate) fn format_context(shared: &BridgeShared, context: Option<&RunContext>) -> String {
    let Some(context) = context else {
        return "none".to_string();
    };
    let Some(project_key) = context.project.as_deref() else {
        return "none".to_string();
    };
    let project = shared.runtime().project_alias_for_key(project_key);
    match context.branch.as_deref() {
        Some(branch) => format!("{project} @{branch}"),
        None => project,
    }
}

/// Parse `<project>? @branch?` arguments for `/ctx set` and `/topic`,
/// pinned to the chat's project in project chats.
fn parse_project_branch_args(
    shared: &BridgeShared,
    args_text: &str,
    require_branch: bool,
    chat_project: Option<&str>,
) -> std::result::Result<RunContext, String> {
    let tokens = split_command_args(args_text);
    if tokens.is_empty() {
        return Err(if require_branch {
            usage_topic(chat_project)
        } else {
            usage_ctx_set(chat_project)
        });
    }
    if tokens.len() > 2 {
        return Err("too many arguments".to_string());
    }
    let mut project_token: Option<&str> = None;
    let mut branch: Option<String> = None;
    let first = tokens[0].as_str();
    if let Some(stripped) = first.strip_prefix('@') {
        branch = (!stripped.is_empty()).then(|| stripped.to_string());
    } else {
        project_token = Some(first);
        if tokens.len() == 2 {
            let second = tokens[1].as_str();
            let Some(stripped) = second.strip_prefix('@') else {
                return Err("branch must be prefixed with @".to_string());
            };
            branch = (!stripped.is_empty()).then(|| stripped.to_string());
        }
    }

    let runtime = shared.runtime();
    let project_key = match chat_project {
        Some(chat_project) => match project_token {
            None => chat_project.to_string(),
            Some(token) => {
                let Some(normalized) = runtime.normalize_project_key(token) else {
                    return Err(format!("unknown project {token:?}"));
                };
                if normalized != chat_project {
                    let expected = runtime.project_alias_for_key(chat_project);
                    return Err(format!(
                        "project mismatch for this chat; expected {expected:?}."
                    ));
                }
                normalized
            }
        },
        None => {
            let Some(token) = project_token else {
                return Err("project is required".to_string());
            };
            let Some(normalized) = runtime.normalize_project_key(token) else {
                return Err(format!("unknown project {token:?}"));
            };
            normalized
        }
    };

    if require_branch && branch.is_none() {
        return Err("branch is required".to_string());
    }

    Ok(RunContext {
        project: Some(project_key),
        branch,
    })
}

fn topic_title(shared: &BridgeShared, context: &RunContext) -> String {
    let project = context
        .project
        .as_deref()
        .map(|key| shared.runtime().project_alias_for_key(key))
        .unwrap_or_default();
    match (project.is_empty(), context.branch.as_deref()) {
        (false, Some(branch)) => format!("{project} @{branch}"),
        (true, Some(branch)) => format!("@{branch}"),
        (false, None) => project,
        (true, None) => "topic".to_string(),
    }
}

/// Rename the forum topic after its binding, skipping the call when the
/// stored title already matches.
pub(crate) async fn maybe_rename_topic(
    shared: &BridgeShared,
    chat_id: i64,
    thread_id: i64,
    context: &RunContext,
) {
    let Some(store) = &shared.topic_store else {
        return;
    };
    let title = topic_title(shared, context);
    match store.get_thread(chat_id, thread_id).await {
        Ok(Some(snapshot)) if snapshot.topic_title.as_deref() == Some(&title) => return,
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "topic state read failed before rename");
        }
    }
    if !shared.cfg.bot.edit_forum_topic(chat_id, thread_id, &title).await {
        warn!(chat_id, thread_id, title = %title, "topic rename failed");
        return;
    }
    if let Err(e) = store
        .set_context(chat_id, thread_id, context.clone(), Some(title), None)
        .await
    {
        warn!(error = %e, "failed to store topic title");
    }
}

/// Startup validation: every scoped chat must be a forum supergroup with
/// the bot an admin that may manage topics.
pub(crate) async fn validate_topics_setup(shared: &BridgeShared) -> Result<()> {
    let me = shared.cfg.bot.get_me().await;
    let bot_id = me
        .as_ref()
        .and_then(|me| me.get("id"))
        .and_then(|id| id.as_i64())
        .ok_or_else(|| {
            TakopiError::Config("failed to fetch bot id for topics validation.".into())
        })?;
    let (scope, chat_ids) = resolve_scope(shared);
    if scope == TopicsScope::Projects && chat_ids.is_empty() {
        return Err(TakopiError::Config(
            "topics enabled but no project chats are configured; \
             set projects.<alias>.chat_id for forum chats or use scope=\"main\"."
                .into(),
        ));
    }
    for chat_id in chat_ids {
        let chat = shared.cfg.bot.get_chat(chat_id).await.ok_or_else(|| {
            TakopiError::Config(format!(
                "failed to fetch chat info for topics validation ({chat_id})."
            ))
        })?;
        if chat.get("type").and_then(|t| t.as_str()) != Some("supergroup") {
            return Err(TakopiError::Config(format!(
                "topics enabled but chat is not a supergroup (chat_id={chat_id}); \
                 convert the group and enable topics."
            )));
        }
        if chat.get("is_forum").and_then(|f| f.as_bool()) != Some(true) {
            return Err(TakopiError::Config(format!(
                "topics enabled but chat does not have topics enabled \
                 (chat_id={chat_id}); turn on topics in group settings."
            )));
        }
        let member = shared
            .cfg
            .bot
            .get_chat_member(chat_id, bot_id)
            .await
            .ok_or_else(|| {
                TakopiError::Config(format!(
                    "failed to fetch bot permissions (chat_id={chat_id}); \
                     promote the bot to admin with manage topics."
                ))
            })?;
        let status = member.get("status").and_then(|s| s.as_str());
        if status == Some("creator") {
            continue;
        }
        if status != Some("administrator") {
            return Err(TakopiError::Config(format!(
                "topics enabled but bot is not an admin (chat_id={chat_id}); \
                 promote it and grant manage topics."
            )));
        }
        if member.get("can_manage_topics").and_then(|c| c.as_bool()) != Some(true) {
            return Err(TakopiError::Config(format!(
                "topics enabled but bot lacks manage topics permission \
                 (chat_id={chat_id}); grant can_manage_topics."
            )));
        }
    }
    Ok(())
}

pub(crate) async fn handle_ctx_command(
    shared: &BridgeShared,
    msg: &TelegramIncomingMessage,
    args_text: &str,
) {
    if let Some(error) = command_error(shared, msg.chat_id) {
        shared
            .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &error)
            .await;
        return;
    }
    let chat_project = chat_project(shared, msg.chat_id);
    let Some((chat_id, thread_id)) = topic_key(shared, msg) else {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "this command only works inside a topic.",
            )
            .await;
        return;
    };
    let Some(store) = &shared.topic_store else {
        return;
    };

    let tokens = split_command_args(args_text);
    let action = tokens.first().map(|t| t.to_lowercase()).unwrap_or_default();
    match action.as_str() {
        "" | "show" => {
            let snapshot = store.get_thread(chat_id, thread_id).await.unwrap_or_default();
            let bound = snapshot.as_ref().and_then(|s| s.context.clone());
            let ambient = merge_topic_context(chat_project.as_deref(), bound.clone());
            let resolved = shared.runtime().resolve_message(
                "",
                msg.reply_to_text.as_deref(),
                ambient.as_ref(),
                Some(msg.chat_id),
            );
            let (resolved_ctx, source) = match &resolved {
                Ok(resolved) => (
                    resolved.context.clone(),
                    resolved.context_source.label(),
                ),
                Err(_) => (None, "none"),
            };
            let mut lines = vec![
                format!("topics: enabled (scope={})", scope_label(shared)),
                format!("bound ctx: {}", format_context(shared, bound.as_ref())),
                format!(
                    "resolved ctx: {} (source: {source})",
                    format_context(shared, resolved_ctx.as_ref())
                ),
            ];
            if chat_project.is_none() && bound.is_none() {
                let topic_usage = usage_topic(None).replace("usage: ", "");
                let ctx_usage = usage_ctx_set(None).replace("usage: ", "");
                lines.push(format!(
                    "note: unbound topic — bind with {topic_usage} or {ctx_usage}"
                ));
            }
            let sessions = snapshot
                .as_ref()
                .filter(|s| !s.sessions.is_empty())
                .map(|s| {
                    let mut engines: Vec<&str> =
                        s.sessions.keys().map(String::as_str).collect();
                    engines.sort_unstable();
                    engines.join(", ")
                });
            lines.push(format!(
                "sessions: {}",
                sessions.unwrap_or_else(|| "none".to_string())
            ));
            shared
                .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &lines.join("\n"))
                .await;
        }
        "set" => {
            let rest = tokens[1..].join(" ");
            let context = match parse_project_branch_args(
                shared,
                &rest,
                false,
                chat_project.as_deref(),
            ) {
                Ok(context) => context,
                Err(error) => {
                    shared
                        .send_plain(
                            msg.chat_id,
                            msg.message_id,
                            msg.thread_id,
                            &format!(
                                "error:\n{error}\n{}",
                                usage_ctx_set(chat_project.as_deref())
                            ),
                        )
                        .await;
                    return;
                }
            };
            if let Err(e) = store
                .set_context(chat_id, thread_id, context.clone(), None, None)
                .await
            {
                warn!(error = %e, "failed to store topic context");
            }
            maybe_rename_topic(shared, chat_id, thread_id, &context).await;
            shared
                .send_plain(
                    msg.chat_id,
                    msg.message_id,
                    msg.thread_id,
                    &format!(
                        "topic bound to `{}`",
                        format_context(shared, Some(&context))
                    ),
                )
                .await;
        }
        "clear" => {
            if let Err(e) = store.clear_context(chat_id, thread_id).await {
                warn!(error = %e, "failed to clear topic context");
            }
            shared
                .send_plain(
                    msg.chat_id,
                    msg.message_id,
                    msg.thread_id,
                    "topic binding cleared.",
                )
                .await;
        }
        _ => {
            shared
                .send_plain(
                    msg.chat_id,
                    msg.message_id,
                    msg.thread_id,
                    "unknown `/ctx` command. use `/ctx`, `/ctx set`, or `/ctx clear`.",
                )
                .await;
        }
    }
}

pub(crate) async fn handle_new_command(shared: &BridgeShared, msg: &TelegramIncomingMessage) {
    if let Some(error) = command_error(shared, msg.chat_id) {
        shared
            .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &error)
            .await;
        return;
    }
    let Some((chat_id, thread_id)) = topic_key(shared, msg) else {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "this command only works inside a topic.",
            )
            .await;
        return;
    };
    if let Some(store) = &shared.topic_store {
        if let Err(e) = store.clear_sessions(chat_id, thread_id).await {
            warn!(error = %e, "failed to clear topic sessions");
        }
    }
    shared
        .send_plain(
            msg.chat_id,
            msg.message_id,
            msg.thread_id,
            "cleared stored sessions for this topic.",
        )
        .await;
}

pub(crate) async fn handle_topic_command(
    shared: &BridgeShared,
    msg: &TelegramIncomingMessage,
    args_text: &str,
) {
    if let Some(error) = command_error(shared, msg.chat_id) {
        shared
            .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &error)
            .await;
        return;
    }
    let chat_project = chat_project(shared, msg.chat_id);
    let context = match parse_project_branch_args(
        shared,
        args_text,
        true,
        chat_project.as_deref(),
    ) {
        Ok(context) => context,
        Err(error) => {
            let usage = usage_topic(chat_project.as_deref());
            shared
                .send_plain(
                    msg.chat_id,
                    msg.message_id,
                    msg.thread_id,
                    &format!("error:\n{error}\n{usage}"),
                )
                .await;
            return;
        }
    };
    let Some(store) = &shared.topic_store else {
        return;
    };
    let existing = store
        .find_thread_for_context(msg.chat_id, &context)
        .await
        .unwrap_or(None);
    if existing.is_some() {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                &format!(
                    "topic already exists for {} in this chat.",
                    format_context(shared, Some(&context))
                ),
            )
            .await;
        return;
    }
    let title = topic_title(shared, &context);
    let created = shared.cfg.bot.create_forum_topic(msg.chat_id, &title).await;
    let Some(thread_id) = created
        .as_ref()
        .and_then(|c| c.get("message_thread_id"))
        .and_then(|id| id.as_i64())
    else {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "failed to create topic.",
            )
            .await;
        return;
    };
    if let Err(e) = store
        .set_context(
            msg.chat_id,
            thread_id,
            context.clone(),
            Some(title.clone()),
            Some(true),
        )
        .await
    {
        warn!(error = %e, "failed to store created topic");
    }
    shared
        .send_plain(
            msg.chat_id,
            msg.message_id,
            msg.thread_id,
            &format!("created topic `{title}`."),
        )
        .await;
    // Confirmation inside the new thread.
    let confirmation = crate::presenter::render_plain(&format!(
        "topic bound to `{}`",
        format_context(shared, Some(&context))
    ));
    shared
        .cfg
        .exec
        .transport
        .send(
            msg.chat_id,
            &confirmation,
            Some(&takopi_core::transport::SendOptions {
                reply_to: None,
                notify: true,
                thread_id: Some(thread_id),
            }),
        )
        .await;
}
