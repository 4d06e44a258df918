//! File-transfer helpers for `/file put` and `/file get`.
//!
//! Pure path and payload logic: command parsing, repo-relative path
//! normalisation, deny-glob screening, atomic writes and directory zips.
//! The wire handlers live in the bridge.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

pub fn file_put_usage() -> &'static str {
    "usage: attach a file with caption `/file put [path] [--force]`"
}

pub fn file_get_usage() -> &'static str {
    "usage: `/file get <path>`"
}

/// Split `/file <sub> ...` arguments into the subcommand and its rest.
pub fn parse_file_command(args_text: &str) -> Result<(String, String), String> {
    let trimmed = args_text.trim();
    let (command, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (trimmed, ""),
    };
    match command {
        "put" | "get" => Ok((command.to_string(), rest.to_string())),
        "" => Err(format!("{}\n{}", file_put_usage(), file_get_usage())),
        other => Err(format!("unknown `/file` subcommand {other:?}.")),
    }
}

/// Parse the free text after `put`/`get`: an optional path and `--force`.
pub fn parse_file_prompt(
    prompt: &str,
    allow_empty: bool,
) -> Result<(Option<String>, bool), String> {
    let mut path = None;
    let mut force = false;
    for token in prompt.split_whitespace() {
        match token {
            "--force" | "-f" => force = true,
            _ if path.is_none() => path = Some(token.to_string()),
            _ => return Err("too many arguments".to_string()),
        }
    }
    if path.is_none() && !allow_empty {
        return Err("path is required".to_string());
    }
    Ok((path, force))
}

/// Normalise a user path to a clean repo-relative path. Rejects absolute
/// paths and any `..` traversal.
pub fn normalize_relative_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let path = Path::new(trimmed);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// First deny rule matching `path`, if any.
pub fn deny_reason(path: &Path, deny_globs: &[String]) -> Option<String> {
    let set = build_globset(deny_globs)?;
    let matches = set.matches(path);
    matches
        .first()
        .and_then(|&idx| deny_globs.get(idx))
        .cloned()
}

fn build_globset(deny_globs: &[String]) -> Option<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in deny_globs {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().ok()
}

/// Join `rel_path` under `root`, refusing any escape (symlink-free lexical
/// check; `rel_path` is already normalised).
pub fn resolve_path_within_root(root: &Path, rel_path: &Path) -> Option<PathBuf> {
    if rel_path.is_absolute() {
        return None;
    }
    if rel_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(rel_path))
}

pub fn format_bytes(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = size as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", size as u64, UNITS[unit])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Upload name: the client-provided filename, else the basename of the
/// service file path, else a stable placeholder.
pub fn default_upload_name(file_name: Option<&str>, file_path: Option<&str>) -> String {
    if let Some(name) = file_name {
        let name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        if let Some(name) = name {
            if !name.is_empty() {
                return name;
            }
        }
    }
    if let Some(path) = file_path {
        if let Some(name) = Path::new(path).file_name() {
            return name.to_string_lossy().into_owned();
        }
    }
    "upload.bin".to_string()
}

/// Default target for an upload without an explicit path.
pub fn default_upload_path(
    uploads_dir: &str,
    file_name: Option<&str>,
    file_path: Option<&str>,
) -> PathBuf {
    Path::new(uploads_dir).join(default_upload_name(file_name, file_path))
}

/// Write via a temp file in the target directory plus rename.
pub fn write_bytes_atomic(target: &Path, payload: &[u8]) -> std::io::Result<()> {
    let parent = target.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(payload)?;
    tmp.flush()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ZipError {
    #[error("directory is too large to send")]
    TooLarge,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("zip failure: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Zip `rel_dir` under `root`, skipping deny-listed entries. Fails once the
/// uncompressed total passes `max_bytes`.
pub fn zip_directory(
    root: &Path,
    rel_dir: &Path,
    deny_globs: &[String],
    max_bytes: u64,
) -> Result<Vec<u8>, ZipError> {
    let base = root.join(rel_dir);
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    let mut total = 0u64;

    let mut stack = vec![base.clone()];
    while let Some(dir) = stack.pop() {
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let rel = rel_dir.join(path.strip_prefix(&base).unwrap_or(&path));
            if deny_reason(&rel, deny_globs).is_some() {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                let payload = std::fs::read(&path)?;
                total += payload.len() as u64;
                if total > max_bytes {
                    return Err(ZipError::TooLarge);
                }
                let name = rel.to_string_lossy().replace('\\', "/");
                writer.start_file(name, options)?;
                writer.write_all(&payload)?;
            }
        }
    }

    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_file_command_variants() {
        assert_eq!(
            parse_file_command("put assets/ --force").unwrap(),
            ("put".into(), "assets/ --force".into())
        );
        assert_eq!(
            parse_file_command("get README.md").unwrap(),
            ("get".into(), "README.md".into())
        );
        assert!(parse_file_command("").is_err());
        assert!(parse_file_command("push x").is_err());
    }

    #[test]
    fn parse_file_prompt_flags() {
        assert_eq!(
            parse_file_prompt("a/b.txt --force", true).unwrap(),
            (Some("a/b.txt".into()), true)
        );
        assert_eq!(parse_file_prompt("", true).unwrap(), (None, false));
        assert!(parse_file_prompt("", false).is_err());
        assert!(parse_file_prompt("a b", true).is_err());
    }

    #[test]
    fn normalize_rejects_traversal() {
        assert_eq!(
            normalize_relative_path("a/./b.txt"),
            Some(PathBuf::from("a/b.txt"))
        );
        assert_eq!(normalize_relative_path("../etc/passwd"), None);
        assert_eq!(normalize_relative_path("/abs/path"), None);
        assert_eq!(normalize_relative_path("  "), None);
        assert_eq!(
            normalize_relative_path("assets/"),
            Some(PathBuf::from("assets"))
        );
    }

    #[test]
    fn deny_globs_match() {
        let globs: Vec<String> = [".git/**", ".env", "**/*.pem"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(deny_reason(Path::new(".git/config"), &globs).is_some());
        assert!(deny_reason(Path::new(".env"), &globs).is_some());
        assert!(deny_reason(Path::new("certs/server.pem"), &globs).is_some());
        assert!(deny_reason(Path::new("src/main.rs"), &globs).is_none());
    }

    #[test]
    fn resolve_within_root() {
        let root = Path::new("/repo");
        assert_eq!(
            resolve_path_within_root(root, Path::new("a/b.txt")),
            Some(PathBuf::from("/repo/a/b.txt"))
        );
        assert_eq!(resolve_path_within_root(root, Path::new("../up")), None);
        assert_eq!(resolve_path_within_root(root, Path::new("/abs")), None);
    }

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn upload_names() {
        assert_eq!(default_upload_name(Some("doc.txt"), None), "doc.txt");
        assert_eq!(
            default_upload_name(Some("../sneaky.txt"), None),
            "sneaky.txt"
        );
        assert_eq!(
            default_upload_name(None, Some("documents/file_7.pdf")),
            "file_7.pdf"
        );
        assert_eq!(default_upload_name(None, None), "upload.bin");
    }

    #[test]
    fn atomic_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/out.txt");
        write_bytes_atomic(&target, b"payload").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
        // Overwrite is atomic too.
        write_bytes_atomic(&target, b"second").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");
    }

    #[test]
    fn zip_directory_skips_denied_and_caps_size() {
        let dir = tempfile::tempdir().unwrap();
        let assets = dir.path().join("assets");
        std::fs::create_dir_all(assets.join("sub")).unwrap();
        std::fs::write(assets.join("a.txt"), b"hello").unwrap();
        std::fs::write(assets.join("secret.pem"), b"key").unwrap();
        std::fs::write(assets.join("sub/b.txt"), b"world").unwrap();

        let globs = vec!["**/*.pem".to_string()];
        let payload =
            zip_directory(dir.path(), Path::new("assets"), &globs, 1024 * 1024).unwrap();
        let mut archive =
            zip::ZipArchive::new(std::io::Cursor::new(payload)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"assets/a.txt".to_string()));
        assert!(names.contains(&"assets/sub/b.txt".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(".pem")));

        let err = zip_directory(dir.path(), Path::new("assets"), &globs, 3).unwrap_err();
        assert!(matches!(err, ZipError::TooLarge));
    }
}
