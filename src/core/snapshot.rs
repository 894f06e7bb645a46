use std::collections::BTreeMap;
use std::path::Path;

use crate::core::{
    domain::{Language, PipelineKind, Role, SourceFile, SourceSnapshot},
    language::{LanguageDetector, is_source_candidate},
};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to list {path}: {source}")]
    ReadDir {
        path: String,
        source: std::io::Error,
    },
}

/// Captures the sources of the roles `kind` needs from `<workspace>/<kind dir>/`.
pub fn build_snapshot(workspace: &Path, kind: PipelineKind) -> Result<SourceSnapshot, SnapshotError> {
    build_snapshot_with(workspace, kind, &LanguageDetector::new())
}

#[tracing::instrument(skip(detector))]
pub fn build_snapshot_with(
    workspace: &Path,
    kind: PipelineKind,
    detector: &LanguageDetector,
) -> Result<SourceSnapshot, SnapshotError> {
    let mut snapshot = SourceSnapshot::empty(kind);
    let dir = workspace.join(kind.workspace_dir());
    if !dir.is_dir() {
        tracing::warn!("Workspace directory not found: {}", dir.display());
        return Ok(snapshot);
    }

    let mut entries: Vec<_> = std::fs::read_dir(&dir)
        .map_err(|source| SnapshotError::ReadDir {
            path: dir.display().to_string(),
            source,
        })?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    // alias rank and file name of the file holding each role so far
    let mut taken: BTreeMap<Role, (usize, String)> = BTreeMap::new();
    for path in entries {
        if !is_source_candidate(&path) {
            continue;
        }
        let (Some(file_name), Some(stem)) = (
            path.file_name().and_then(|name| name.to_str()),
            path.file_stem().and_then(|stem| stem.to_str()),
        ) else {
            continue;
        };
        let Some((role, rank)) =
            Role::from_file_stem(stem).filter(|(role, _)| kind.requires(*role))
        else {
            continue;
        };
        if taken.get(&role).is_some_and(|(held, _)| *held <= rank) {
            continue;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                // compiled artifacts without an extension land here
                tracing::debug!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let Some(language) = detector.detect(&path, &content) else {
            tracing::debug!("Skipping {}: unknown language", path.display());
            continue;
        };

        if let Some((_, replaced)) = taken.insert(role, (rank, file_name.to_string())) {
            snapshot.files.remove(&replaced);
        }
        snapshot.files.insert(
            file_name.to_string(),
            SourceFile {
                content,
                language,
                role,
            },
        );
    }

    snapshot.primary_language = primary_language(&snapshot.files);
    tracing::info!(
        files = snapshot.files.len(),
        primary_language = ?snapshot.primary_language,
        "Snapshot created"
    );
    Ok(snapshot)
}

fn primary_language(files: &BTreeMap<String, SourceFile>) -> Option<Language> {
    let order = [Language::Cpp, Language::Python, Language::Java];
    let count = |language| files.values().filter(|file| file.language == language).count();
    order
        .into_iter()
        .map(|language| (language, count(language)))
        .filter(|(_, count)| *count > 0)
        .fold(None, |best: Option<(Language, usize)>, (language, count)| match best {
            Some((_, top)) if top >= count => best,
            _ => Some((language, count)),
        })
        .map(|(language, _)| language)
}
