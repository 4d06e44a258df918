//! `/file put` / `/file get` wire handlers.

use std::path::PathBuf;

use tracing::warn;

use takopi_core::context::RunContext;
use takopi_engine::runtime::ContextSource;

use crate::bridge::BridgeShared;
use crate::files::{
    default_upload_name, default_upload_path, deny_reason, file_get_usage, file_put_usage,
    format_bytes, normalize_relative_path, parse_file_command, parse_file_prompt,
    resolve_path_within_root, write_bytes_atomic, zip_directory, ZipError,
};
use crate::topics;
use crate::types::{TelegramDocument, TelegramIncomingMessage};

struct FilePutPlan {
    context: Option<RunContext>,
    run_root: PathBuf,
    path_value: Option<String>,
    force: bool,
}

struct FilePutResult {
    name: String,
    rel_path: Option<PathBuf>,
    size: Option<u64>,
    error: Option<String>,
}

impl FilePutResult {
    fn failed(name: String, error: impl Into<String>) -> Self {
        Self {
            name,
            rel_path: None,
            size: None,
            error: Some(error.into()),
        }
    }
}

/// Group chats restrict transfers to admins unless an explicit allow-list
/// is configured.
async fn check_file_permissions(shared: &BridgeShared, msg: &TelegramIncomingMessage) -> bool {
    let Some(sender_id) = msg.sender_id else {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "cannot verify sender for file transfer.",
            )
            .await;
        return false;
    };
    if !shared.cfg.files.allowed_user_ids.is_empty() {
        if shared.cfg.files.allowed_user_ids.contains(&sender_id) {
            return true;
        }
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "file transfer is not allowed for this user.",
            )
            .await;
        return false;
    }
    let is_private = match msg.chat_type.as_deref() {
        Some(chat_type) => chat_type == "private",
        None => msg.chat_id > 0,
    };
    if is_private {
        return true;
    }
    let member = shared.cfg.bot.get_chat_member(msg.chat_id, sender_id).await;
    let Some(member) = member else {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "failed to verify file transfer permissions.",
            )
            .await;
        return false;
    };
    let status = member.get("status").and_then(|s| s.as_str());
    if matches!(status, Some("creator") | Some("administrator")) {
        return true;
    }
    shared
        .send_plain(
            msg.chat_id,
            msg.message_id,
            msg.thread_id,
            "file transfer is restricted to group admins.",
        )
        .await;
    false
}

async fn prepare_file_put_plan(
    shared: &BridgeShared,
    msg: &TelegramIncomingMessage,
    args_text: &str,
    ambient_context: Option<RunContext>,
) -> Option<FilePutPlan> {
    if !check_file_permissions(shared, msg).await {
        return None;
    }
    let runtime = shared.runtime();
    let resolved = match runtime.resolve_message(
        args_text,
        msg.reply_to_text.as_deref(),
        ambient_context.as_ref(),
        Some(msg.chat_id),
    ) {
        Ok(resolved) => resolved,
        Err(e) => {
            shared
                .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &format!("error:\n{e}"))
                .await;
            return None;
        }
    };
    // An explicit project in the caption binds the topic like any message.
    if resolved.context_source == ContextSource::Directives {
        if let (Some(store), Some((chat_id, thread_id)), Some(context)) = (
            &shared.topic_store,
            topics::topic_key(shared, msg),
            resolved.context.as_ref(),
        ) {
            if let Err(e) = store
                .set_context(chat_id, thread_id, context.clone(), None, None)
                .await
            {
                warn!(error = %e, "failed to store topic context");
            }
            topics::maybe_rename_topic(shared, chat_id, thread_id, context).await;
        }
    }
    let has_project = resolved
        .context
        .as_ref()
        .is_some_and(|c| c.project.is_some());
    if !has_project {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "no project context available for file upload.",
            )
            .await;
        return None;
    }
    let run_root = match runtime.resolve_run_cwd(resolved.context.as_ref()) {
        Ok(Some(run_root)) => run_root,
        Ok(None) => {
            shared
                .send_plain(
                    msg.chat_id,
                    msg.message_id,
                    msg.thread_id,
                    "no project context available for file upload.",
                )
                .await;
            return None;
        }
        Err(e) => {
            shared
                .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &format!("error:\n{e}"))
                .await;
            return None;
        }
    };
    let (path_value, force) = match parse_file_prompt(&resolved.prompt, true) {
        Ok(parsed) => parsed,
        Err(error) => {
            shared
                .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &error)
                .await;
            return None;
        }
    };
    Some(FilePutPlan {
        context: resolved.context,
        run_root,
        path_value,
        force,
    })
}

async fn save_document_payload(
    shared: &BridgeShared,
    document: &TelegramDocument,
    run_root: &std::path::Path,
    rel_path: Option<PathBuf>,
    base_dir: Option<&PathBuf>,
    force: bool,
) -> FilePutResult {
    let mut name = default_upload_name(document.file_name.as_deref(), None);
    if document.file_size.unwrap_or(0) > shared.cfg.files.max_upload_bytes {
        return FilePutResult::failed(name, "file is too large to upload.");
    }
    let file_info = shared.cfg.bot.get_file(&document.file_id).await;
    let Some(file_path) = file_info
        .as_ref()
        .and_then(|info| info.get("file_path"))
        .and_then(|p| p.as_str())
    else {
        return FilePutResult::failed(name, "failed to fetch file metadata.");
    };
    name = default_upload_name(document.file_name.as_deref(), Some(file_path));

    let resolved_path = match rel_path {
        Some(rel_path) => rel_path,
        None => match base_dir {
            Some(base_dir) => base_dir.join(&name),
            None => default_upload_path(
                &shared.cfg.files.uploads_dir,
                document.file_name.as_deref(),
                Some(file_path),
            ),
        },
    };
    if let Some(rule) = deny_reason(&resolved_path, &shared.cfg.files.deny_globs) {
        return FilePutResult::failed(name, format!("path denied by rule: {rule}"));
    }
    let Some(target) = resolve_path_within_root(run_root, &resolved_path) else {
        return FilePutResult::failed(name, "upload path escapes the repo root.");
    };
    if target.exists() {
        if target.is_dir() {
            return FilePutResult::failed(name, "upload target is a directory.");
        }
        if !force {
            return FilePutResult::failed(name, "file already exists; use --force to overwrite.");
        }
    }
    let Some(payload) = shared.cfg.bot.download_file(file_path).await else {
        return FilePutResult::failed(name, "failed to download file.");
    };
    if payload.len() as u64 > shared.cfg.files.max_upload_bytes {
        return FilePutResult::failed(name, "file is too large to upload.");
    }
    let size = payload.len() as u64;
    if let Err(e) = write_bytes_atomic(&target, &payload) {
        return FilePutResult::failed(name, format!("failed to write file: {e}"));
    }
    FilePutResult {
        name,
        rel_path: Some(resolved_path),
        size: Some(size),
        error: None,
    }
}

pub(crate) async fn handle_file_command(
    shared: &BridgeShared,
    msg: &TelegramIncomingMessage,
    args_text: &str,
    ambient_context: Option<RunContext>,
) {
    let (command, rest) = match parse_file_command(args_text) {
        Ok(parsed) => parsed,
        Err(error) => {
            shared
                .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &error)
                .await;
            return;
        }
    };
    if command == "put" {
        handle_file_put(shared, msg, &rest, ambient_context).await;
    } else {
        handle_file_get(shared, msg, &rest, ambient_context).await;
    }
}

pub(crate) async fn handle_file_put(
    shared: &BridgeShared,
    msg: &TelegramIncomingMessage,
    args_text: &str,
    ambient_context: Option<RunContext>,
) {
    let Some(document) = msg.document.clone() else {
        shared
            .send_plain(msg.chat_id, msg.message_id, msg.thread_id, file_put_usage())
            .await;
        return;
    };
    let Some(plan) = prepare_file_put_plan(shared, msg, args_text, ambient_context).await else {
        return;
    };
    let mut rel_path: Option<PathBuf> = None;
    let mut base_dir: Option<PathBuf> = None;
    if let Some(path_value) = &plan.path_value {
        if path_value.ends_with('/') {
            match validate_base_dir(shared, msg, &plan, path_value).await {
                Some(validated) => base_dir = Some(validated),
                None => return,
            }
        } else {
            match normalize_relative_path(path_value) {
                Some(normalized) => rel_path = Some(normalized),
                None => {
                    shared
                        .send_plain(
                            msg.chat_id,
                            msg.message_id,
                            msg.thread_id,
                            "invalid upload path.",
                        )
                        .await;
                    return;
                }
            }
        }
    }
    let result = save_document_payload(
        shared,
        &document,
        &plan.run_root,
        rel_path,
        base_dir.as_ref(),
        plan.force,
    )
    .await;
    if let Some(error) = &result.error {
        shared
            .send_plain(msg.chat_id, msg.message_id, msg.thread_id, error)
            .await;
        return;
    }
    let (Some(rel_path), Some(size)) = (&result.rel_path, result.size) else {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "failed to save file.",
            )
            .await;
        return;
    };
    let context_label = topics::format_context(shared, plan.context.as_ref());
    shared
        .send_plain(
            msg.chat_id,
            msg.message_id,
            msg.thread_id,
            &format!(
                "saved `{}` in `{context_label}` ({})",
                rel_path.display(),
                format_bytes(size)
            ),
        )
        .await;
}

/// Validate a trailing-slash upload directory against the deny rules and
/// the repo root.
async fn validate_base_dir(
    shared: &BridgeShared,
    msg: &TelegramIncomingMessage,
    plan: &FilePutPlan,
    path_value: &str,
) -> Option<PathBuf> {
    let Some(base_dir) = normalize_relative_path(path_value) else {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "invalid upload path.",
            )
            .await;
        return None;
    };
    if let Some(rule) = deny_reason(&base_dir, &shared.cfg.files.deny_globs) {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                &format!("path denied by rule: {rule}"),
            )
            .await;
        return None;
    }
    let Some(base_target) = resolve_path_within_root(&plan.run_root, &base_dir) else {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "upload path escapes the repo root.",
            )
            .await;
        return None;
    };
    if base_target.exists() && !base_target.is_dir() {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "upload path is a file.",
            )
            .await;
        return None;
    }
    Some(base_dir)
}

async fn handle_file_put_group(
    shared: &BridgeShared,
    command_msg: &TelegramIncomingMessage,
    args_text: &str,
    messages: &[TelegramIncomingMessage],
    ambient_context: Option<RunContext>,
) {
    let documents: Vec<&TelegramDocument> =
        messages.iter().filter_map(|m| m.document.as_ref()).collect();
    if documents.is_empty() {
        shared
            .send_plain(
                command_msg.chat_id,
                command_msg.message_id,
                command_msg.thread_id,
                file_put_usage(),
            )
            .await;
        return;
    }
    let Some(plan) =
        prepare_file_put_plan(shared, command_msg, args_text, ambient_context).await
    else {
        return;
    };
    let mut base_dir: Option<PathBuf> = None;
    if let Some(path_value) = &plan.path_value {
        match validate_base_dir(shared, command_msg, &plan, path_value).await {
            Some(validated) => base_dir = Some(validated),
            None => return,
        }
    }
    let mut saved = Vec::new();
    let mut failed = Vec::new();
    for document in documents {
        let result = save_document_payload(
            shared,
            document,
            &plan.run_root,
            None,
            base_dir.as_ref(),
            plan.force,
        )
        .await;
        if result.error.is_none() {
            saved.push(result);
        } else {
            failed.push(result);
        }
    }
    let context_label = topics::format_context(shared, plan.context.as_ref());
    let total_bytes: u64 = saved.iter().filter_map(|r| r.size).sum();
    let dir_label = base_dir.clone().or_else(|| {
        saved
            .first()
            .and_then(|r| r.rel_path.as_ref())
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    });
    let mut text = if saved.is_empty() {
        "failed to upload files.".to_string()
    } else {
        let saved_names: Vec<String> =
            saved.iter().map(|r| format!("`{}`", r.name)).collect();
        let saved_names = saved_names.join(", ");
        match dir_label.filter(|d| !d.as_os_str().is_empty()) {
            Some(dir) => format!(
                "saved {saved_names} to `{}/` in `{context_label}` ({})",
                dir.display(),
                format_bytes(total_bytes)
            ),
            None => format!(
                "saved {saved_names} in `{context_label}` ({})",
                format_bytes(total_bytes)
            ),
        }
    };
    if !failed.is_empty() {
        let errors: Vec<String> = failed
            .iter()
            .filter_map(|r| {
                r.error
                    .as_ref()
                    .map(|e| format!("`{}` ({e})", r.name))
            })
            .collect();
        if !errors.is_empty() {
            text = format!("{text}\n\nfailed: {}", errors.join(", "));
        }
    }
    shared
        .send_plain(
            command_msg.chat_id,
            command_msg.message_id,
            command_msg.thread_id,
            &text,
        )
        .await;
}

pub(crate) async fn handle_file_get(
    shared: &BridgeShared,
    msg: &TelegramIncomingMessage,
    args_text: &str,
    ambient_context: Option<RunContext>,
) {
    if !check_file_permissions(shared, msg).await {
        return;
    }
    let runtime = shared.runtime();
    let resolved = match runtime.resolve_message(
        args_text,
        msg.reply_to_text.as_deref(),
        ambient_context.as_ref(),
        Some(msg.chat_id),
    ) {
        Ok(resolved) => resolved,
        Err(e) => {
            shared
                .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &format!("error:\n{e}"))
                .await;
            return;
        }
    };
    let has_project = resolved
        .context
        .as_ref()
        .is_some_and(|c| c.project.is_some());
    if !has_project {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "no project context available for file fetch.",
            )
            .await;
        return;
    }
    let run_root = match runtime.resolve_run_cwd(resolved.context.as_ref()) {
        Ok(Some(run_root)) => run_root,
        Ok(None) => {
            shared
                .send_plain(
                    msg.chat_id,
                    msg.message_id,
                    msg.thread_id,
                    "no project context available for file fetch.",
                )
                .await;
            return;
        }
        Err(e) => {
            shared
                .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &format!("error:\n{e}"))
                .await;
            return;
        }
    };
    let path_value = match parse_file_prompt(&resolved.prompt, false) {
        Ok((path_value, _)) => path_value.unwrap_or_default(),
        Err(_) => {
            shared
                .send_plain(msg.chat_id, msg.message_id, msg.thread_id, file_get_usage())
                .await;
            return;
        }
    };
    let Some(rel_path) = normalize_relative_path(&path_value) else {
        shared
            .send_plain(msg.chat_id, msg.message_id, msg.thread_id, "invalid file path.")
            .await;
        return;
    };
    if let Some(rule) = deny_reason(&rel_path, &shared.cfg.files.deny_globs) {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                &format!("path denied by rule: {rule}"),
            )
            .await;
        return;
    }
    let Some(target) = resolve_path_within_root(&run_root, &rel_path) else {
        shared
            .send_plain(
                msg.chat_id,
                msg.message_id,
                msg.thread_id,
                "requested path escapes the repo root.",
            )
            .await;
        return;
    };
    if !target.exists() {
        shared
            .send_plain(msg.chat_id, msg.message_id, msg.thread_id, "file not found.")
            .await;
        return;
    }

    let (payload, filename) = if target.is_dir() {
        match zip_directory(
            &run_root,
            &rel_path,
            &shared.cfg.files.deny_globs,
            shared.cfg.files.max_download_bytes,
        ) {
            Ok(payload) => {
                let stem = rel_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "archive".to_string());
                (payload, format!("{stem}.zip"))
            }
            Err(ZipError::TooLarge) => {
                shared
                    .send_plain(
                        msg.chat_id,
                        msg.message_id,
                        msg.thread_id,
                        "file is too large to send.",
                    )
                    .await;
                return;
            }
            Err(e) => {
                shared
                    .send_plain(
                        msg.chat_id,
                        msg.message_id,
                        msg.thread_id,
                        &format!("failed to read directory: {e}"),
                    )
                    .await;
                return;
            }
        }
    } else {
        let size = target.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
        if size > shared.cfg.files.max_download_bytes {
            shared
                .send_plain(
                    msg.chat_id,
                    msg.message_id,
                    msg.thread_id,
                    "file is too large to send.",
                )
                .await;
            return;
        }
        match std::fs::read(&target) {
            Ok(payload) => {
                let filename = target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file.bin".to_string());
                (payload, filename)
            }
            Err(e) => {
                shared
                    .send_plain(
                        msg.chat_id,
                        msg.message_id,
                        msg.thread_id,
                        &format!("failed to read file: {e}"),
                    )
                    .await;
                return;
            }
        }
    };

    let sent = shared
        .cfg
        .exec
        .transport
        .send_document(
            msg.chat_id,
            &filename,
            payload,
            Some(takopi_core::model::MessageRef::new(msg.chat_id, msg.message_id)),
            msg.thread_id,
        )
        .await;
    if sent.is_none() {
        shared
            .send_plain(msg.chat_id, msg.message_id, msg.thread_id, "failed to send file.")
            .await;
    }
}

/// A flushed media group: one logical command over several documents.
pub(crate) async fn handle_media_group(
    shared: &BridgeShared,
    mut messages: Vec<TelegramIncomingMessage>,
) {
    if messages.is_empty() {
        return;
    }
    messages.sort_by_key(|m| m.message_id);
    let command_msg = messages
        .iter()
        .find(|m| !m.text.trim().is_empty())
        .unwrap_or(&messages[0])
        .clone();

    let chat_project = if shared.cfg.topics.enabled {
        topics::chat_project(shared, command_msg.chat_id)
    } else {
        None
    };
    let bound_context = match (
        &shared.topic_store,
        topics::topic_key(shared, &command_msg),
    ) {
        (Some(store), Some((chat_id, thread_id))) => {
            store.get_context(chat_id, thread_id).await.unwrap_or_default()
        }
        _ => None,
    };
    let ambient_context =
        topics::merge_topic_context(chat_project.as_deref(), bound_context);

    let (command_id, args_text) = crate::bridge::parse_slash_command(&command_msg.text);
    if command_id.as_deref() == Some("file") {
        if !shared.cfg.files.enabled {
            shared
                .send_plain(
                    command_msg.chat_id,
                    command_msg.message_id,
                    command_msg.thread_id,
                    "file transfer disabled; enable `[transports.telegram.files]`.",
                )
                .await;
            return;
        }
        match parse_file_command(&args_text) {
            Ok((command, rest)) if command == "put" => {
                handle_file_put_group(
                    shared,
                    &command_msg,
                    &rest,
                    &messages,
                    ambient_context,
                )
                .await;
            }
            Ok(_) => {
                shared
                    .send_plain(
                        command_msg.chat_id,
                        command_msg.message_id,
                        command_msg.thread_id,
                        file_put_usage(),
                    )
                    .await;
            }
            Err(error) => {
                shared
                    .send_plain(
                        command_msg.chat_id,
                        command_msg.message_id,
                        command_msg.thread_id,
                        &error,
                    )
                    .await;
            }
        }
        return;
    }
    if shared.cfg.files.enabled
        && shared.cfg.files.auto_put
        && command_msg.text.trim().is_empty()
    {
        handle_file_put_group(shared, &command_msg, "", &messages, ambient_context).await;
        return;
    }
    if shared.cfg.files.enabled {
        shared
            .send_plain(
                command_msg.chat_id,
                command_msg.message_id,
                command_msg.thread_id,
                file_put_usage(),
            )
            .await;
    }
}
