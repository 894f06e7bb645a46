use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::domain::{PipelineKind, Role};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("no runnable {role} found in {dir}")]
    NotFound { role: Role, dir: String },
    #[error("invalid command for {role}: {msg}")]
    Parse { role: Role, msg: String },
    #[error("empty command for {role}")]
    Empty { role: Role },
}

/// Argument vectors for each role, as they will be spawned (no shell involved).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSet {
    commands: BTreeMap<Role, Vec<String>>,
}

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: Role, argv: Vec<String>) -> Self {
        self.set(role, argv);
        self
    }

    pub fn set(&mut self, role: Role, argv: Vec<String>) {
        self.commands.insert(role, argv);
    }

    /// Splits `line` with shell quoting rules into an argument vector.
    pub fn set_from_line(&mut self, role: Role, line: &str) -> Result<(), CommandError> {
        let argv = shell_words::split(line).map_err(|e| CommandError::Parse {
            role,
            msg: e.to_string(),
        })?;
        if argv.is_empty() {
            return Err(CommandError::Empty { role });
        }
        self.set(role, argv);
        Ok(())
    }

    pub fn get(&self, role: Role) -> Option<&[String]> {
        self.commands.get(&role).map(Vec::as_slice)
    }

    /// Locates a runnable artifact for every role `kind` needs inside
    /// `<workspace>/<kind dir>/`. Roles already set are left untouched.
    pub fn resolve_workspace(
        &mut self,
        workspace: &Path,
        kind: PipelineKind,
    ) -> Result<(), CommandError> {
        let dir = workspace.join(kind.workspace_dir());
        for &role in kind.roles() {
            if self.commands.contains_key(&role) {
                continue;
            }
            let argv = runnable_in(&dir, role).ok_or_else(|| CommandError::NotFound {
                role,
                dir: dir.display().to_string(),
            })?;
            tracing::debug!(%role, ?argv, "Resolved command");
            self.set(role, argv);
        }
        Ok(())
    }
}

fn runnable_in(dir: &Path, role: Role) -> Option<Vec<String>> {
    let stem = role.file_stem();
    let path = |name: String| -> PathBuf { dir.join(name) };
    let display = |path: &Path| path.display().to_string();

    for candidate in [path(stem.to_string()), path(format!("{stem}.exe"))] {
        if is_executable(&candidate) {
            return Some(vec![display(&candidate)]);
        }
    }

    let python = path(format!("{stem}.py"));
    if python.is_file() {
        return Some(vec!["python3".to_string(), "-u".to_string(), display(&python)]);
    }

    let java_class = path(format!("{stem}.class"));
    if java_class.is_file() {
        return Some(vec![
            "java".to_string(),
            "-cp".to_string(),
            display(dir),
            stem.to_string(),
        ]);
    }

    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
