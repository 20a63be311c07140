//! Folder import.
//!
//! Walks a directory, keeps files matching the include globs and not the
//! exclude globs, infers each file's [`SourceType`] from its extension and
//! registers it with a knowledge base. Files whose extension has no
//! extractor are skipped. A file whose name and content hash match a live
//! document of the knowledge base is not added twice.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use kb_engine_core::models::{Document, SourceType};

use crate::engine::KnowledgeEngine;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            include_globs: vec!["**/*".to_string()],
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

/// A file selected for import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportCandidate {
    pub path: PathBuf,
    /// Path relative to the import root, `/`-separated; used as document name.
    pub relative: String,
    pub source_type: SourceType,
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub added: Vec<Document>,
    /// Already present with identical content.
    pub unchanged: Vec<String>,
    /// No extractor for the extension.
    pub unsupported: Vec<String>,
}

/// Files under `root` selected by `options`, sorted by relative path.
/// Returns the candidates and the relative paths skipped as unsupported.
pub fn scan_folder(root: &Path, options: &ImportOptions) -> Result<(Vec<ImportCandidate>, Vec<String>)> {
    if !root.is_dir() {
        bail!("Import root is not a directory: {}", root.display());
    }

    let include_set = build_globset(&options.include_globs)?;
    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(options.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let mut candidates = Vec::new();
    let mut unsupported = Vec::new();

    for entry in WalkDir::new(root).follow_links(options.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let source_type = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(SourceType::from_extension);
        match source_type {
            Some(source_type) => candidates.push(ImportCandidate {
                path: path.to_path_buf(),
                relative: rel_str,
                source_type,
            }),
            None => {
                tracing::debug!(file = %rel_str, "no extractor for file, skipping");
                unsupported.push(rel_str);
            }
        }
    }

    candidates.sort_by(|a, b| a.relative.cmp(&b.relative));
    unsupported.sort();
    Ok((candidates, unsupported))
}

/// Register every selected file under `root` with the knowledge base.
pub async fn import_folder(
    engine: &KnowledgeEngine,
    kb_id: &str,
    root: &Path,
    options: &ImportOptions,
) -> Result<ImportSummary> {
    let (candidates, unsupported) = scan_folder(root, options)?;
    let existing: HashSet<(String, String)> = engine
        .list_documents(kb_id)
        .await?
        .into_iter()
        .map(|d| (d.name, d.content_hash))
        .collect();

    let mut summary = ImportSummary {
        unsupported,
        ..Default::default()
    };
    for candidate in candidates {
        let bytes = std::fs::read(&candidate.path)
            .with_context(|| format!("Failed to read {}", candidate.path.display()))?;
        let hash = format!("{:x}", Sha256::digest(&bytes));
        if existing.contains(&(candidate.relative.clone(), hash)) {
            summary.unchanged.push(candidate.relative);
            continue;
        }
        let doc = engine
            .add_document(
                kb_id,
                &candidate.relative,
                candidate.source_type.as_str(),
                &bytes,
                Some(candidate.path.display().to_string()),
            )
            .await?;
        summary.added.push(doc);
    }
    tracing::info!(
        kb = %kb_id,
        added = summary.added.len(),
        unchanged = summary.unchanged.len(),
        unsupported = summary.unsupported.len(),
        "folder imported"
    );
    Ok(summary)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
