use serde::{Deserialize, Serialize};

/// `(project, branch)` pair selecting the working directory of a run.
///
/// Either side may be absent. A context with both absent is never
/// constructed; callers use `Option<RunContext>` for "no context".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub project: Option<String>,
    pub branch: Option<String>,
}

impl RunContext {
    pub fn new(project: Option<String>, branch: Option<String>) -> Option<Self> {
        if project.is_none() && branch.is_none() {
            return None;
        }
        Some(Self { project, branch })
    }

    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            branch: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_absent_is_none() {
        assert_eq!(RunContext::new(None, None), None);
    }

    #[test]
    fn branch_only_is_some() {
        let ctx = RunContext::new(None, Some("feat".into())).unwrap();
        assert_eq!(ctx.branch.as_deref(), Some("feat"));
        assert!(ctx.project.is_none());
    }
}
