//! Working-directory resolution for runs.
//!
//! A context with only a project runs in the project root. A context with a
//! branch runs in `<path>/<worktrees_dir>/<branch>`, which is expected to be
//! an existing git worktree; Takopi does not create worktrees itself.

use std::path::PathBuf;

use crate::config::ProjectsConfig;
use crate::context::RunContext;
use crate::error::{Result, TakopiError};

pub fn resolve_run_cwd(
    context: Option<&RunContext>,
    projects: &ProjectsConfig,
) -> Result<Option<PathBuf>> {
    let Some(context) = context else {
        return Ok(None);
    };
    let Some(project_key) = context.project.as_deref() else {
        // Branch with no project cannot be located.
        return Err(TakopiError::Config(format!(
            "branch @{} given without a project.",
            context.branch.as_deref().unwrap_or("")
        )));
    };
    let project = projects.get(project_key).ok_or_else(|| {
        TakopiError::Config(format!("unknown project {project_key:?}."))
    })?;
    let root = match context.branch.as_deref() {
        None => project.path.clone(),
        Some(branch) => project.path.join(&project.worktrees_dir).join(branch),
    };
    if !root.is_dir() {
        return Err(TakopiError::Config(format!(
            "run directory {} does not exist{}.",
            root.display(),
            context
                .branch
                .as_deref()
                .map(|b| format!(" (worktree for @{b} missing)"))
                .unwrap_or_default()
        )));
    }
    Ok(Some(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use std::collections::HashMap;

    fn projects_with(path: PathBuf) -> ProjectsConfig {
        let mut projects = HashMap::new();
        projects.insert(
            "proj".to_string(),
            ProjectConfig {
                alias: "proj".into(),
                path,
                worktrees_dir: ".worktrees".into(),
                worktree_base: None,
                default_engine: None,
                chat_id: None,
            },
        );
        ProjectsConfig {
            projects,
            default_project: None,
            chat_map: HashMap::new(),
        }
    }

    #[test]
    fn no_context_resolves_to_none() {
        let projects = projects_with("/tmp".into());
        assert_eq!(resolve_run_cwd(None, &projects).unwrap(), None);
    }

    #[test]
    fn project_root_when_no_branch() {
        let dir = tempfile::tempdir().unwrap();
        let projects = projects_with(dir.path().to_path_buf());
        let ctx = RunContext::project("proj");
        let cwd = resolve_run_cwd(Some(&ctx), &projects).unwrap().unwrap();
        assert_eq!(cwd, dir.path());
    }

    #[test]
    fn branch_resolves_into_worktrees_dir() {
        let dir = tempfile::tempdir().unwrap();
        let wt = dir.path().join(".worktrees").join("feat");
        std::fs::create_dir_all(&wt).unwrap();
        let projects = projects_with(dir.path().to_path_buf());
        let ctx = RunContext::new(Some("proj".into()), Some("feat".into())).unwrap();
        let cwd = resolve_run_cwd(Some(&ctx), &projects).unwrap().unwrap();
        assert_eq!(cwd, wt);
    }

    #[test]
    fn missing_worktree_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let projects = projects_with(dir.path().to_path_buf());
        let ctx = RunContext::new(Some("proj".into()), Some("gone".into())).unwrap();
        let err = resolve_run_cwd(Some(&ctx), &projects).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn branch_without_project_is_error() {
        let projects = projects_with("/tmp".into());
        let ctx = RunContext::new(None, Some("feat".into())).unwrap();
        assert!(resolve_run_cwd(Some(&ctx), &projects).is_err());
    }
}
