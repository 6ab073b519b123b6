//! Obsidian-style vault scanning.
//!
//! A note's place in the folder tree is its metadata:
//!
//! ```text
//! <root>/<category>/<book>/<chapter>/Notes - <title>.md
//! ```
//!
//! Every level is optional. Notes at the vault root fall into
//! [`DEFAULT_CATEGORY`]. Wiki links (`[[Target]]`, `[[Target|Alias]]`) are
//! collected as outbound links.

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use vault_rag_core::error::IngestionError;
use vault_rag_core::models::{Document, DocumentMetadata, DEFAULT_CATEGORY};

use crate::config::VaultConfig;

const TITLE_PREFIX: &str = "Notes - ";
const MAX_ID_LEN: usize = 100;
const TRUNCATED_ID_LEN: usize = 80;

static WIKI_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\]|]+)(?:\|[^\]]+)?\]\]").expect("valid wiki link regex"));

/// Result of a vault scan. Notes that failed to parse are reported, not
/// fatal.
#[derive(Debug, Default)]
pub struct VaultScan {
    pub documents: Vec<Document>,
    pub failures: Vec<IngestionError>,
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

pub fn scan_vault(config: &VaultConfig) -> Result<VaultScan> {
    let root = expand_home(&config.root);
    if !root.exists() {
        bail!("Vault root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut scan = VaultScan::default();
    for entry in WalkDir::new(&root).follow_links(config.follow_symlinks) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                scan.failures.push(IngestionError::new(path, e.to_string()));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        if exclude_set.is_match(relative) || !include_set.is_match(relative) {
            continue;
        }

        match read_note(path, relative) {
            Ok(doc) => scan.documents.push(doc),
            Err(e) => {
                tracing::warn!(error = %e, "skipping note");
                scan.failures.push(e);
            }
        }
    }

    scan.documents.sort_by(|a, b| a.metadata.source_path.cmp(&b.metadata.source_path));
    reject_duplicate_ids(&mut scan);
    Ok(scan)
}

/// Two notes whose paths slug to the same id would overwrite each other.
/// The first in path order wins; the rest become failures.
fn reject_duplicate_ids(scan: &mut VaultScan) {
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut kept = Vec::with_capacity(scan.documents.len());
    for doc in std::mem::take(&mut scan.documents) {
        match owners.get(&doc.id) {
            Some(owner) => {
                let err = IngestionError::new(
                    doc.metadata.source_path.as_str(),
                    format!("document id '{}' already used by {}", doc.id, owner),
                );
                tracing::warn!(error = %err, "skipping note");
                scan.failures.push(err);
            }
            None => {
                owners.insert(doc.id.clone(), doc.metadata.source_path.clone());
                kept.push(doc);
            }
        }
    }
    scan.documents = kept;
}

fn read_note(path: &Path, relative: &Path) -> Result<Document, IngestionError> {
    let rel = relative.to_string_lossy();
    let content =
        std::fs::read_to_string(path).map_err(|e| IngestionError::new(rel.as_ref(), e.to_string()))?;
    let modified_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);
    parse_note(relative, &content, modified_at)
}

/// Build a [`Document`] from a note's vault-relative path and contents.
pub fn parse_note(
    relative: &Path,
    content: &str,
    modified_at: Option<i64>,
) -> Result<Document, IngestionError> {
    let source_path = relative.to_string_lossy().replace('\\', "/");
    if content.trim().is_empty() {
        return Err(IngestionError::new(source_path, "note is empty"));
    }

    let stem = relative
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let title = stem.strip_prefix(TITLE_PREFIX).unwrap_or(&stem).trim().to_string();

    let dirs: Vec<String> = relative
        .parent()
        .into_iter()
        .flat_map(|p| p.components())
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    let category = dirs
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
    let book = dirs.get(1).cloned();
    let chapter = dirs.get(2).cloned();

    let doc = Document {
        id: document_id(dirs.iter().map(String::as_str).chain([stem.as_str()])),
        title,
        category,
        book,
        chapter,
        full_text: content.to_string(),
        outbound_links: extract_links(content),
        metadata: DocumentMetadata {
            source_path,
            modified_at,
            word_count: content.split_whitespace().count(),
        },
    };
    doc.validate()?;
    Ok(doc)
}

/// Targets of `[[Target]]` and `[[Target|Alias]]` links.
pub fn extract_links(content: &str) -> BTreeSet<String> {
    WIKI_LINK
        .captures_iter(content)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Lowercase, drop punctuation, join words with `-`. `_` is reserved as
/// the id segment separator and never survives.
pub fn slugify(text: &str) -> String {
    let kept: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    kept.split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Stable document id from every component of the note's vault-relative
/// path (directories, then the file stem). Long ids are cut and suffixed
/// with a hash so they stay unique.
pub fn document_id<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    let slug = segments
        .into_iter()
        .map(slugify)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    if slug.chars().count() <= MAX_ID_LEN {
        return slug;
    }
    let digest = format!("{:x}", Sha256::digest(slug.as_bytes()));
    let head: String = slug.chars().take(TRUNCATED_ID_LEN).collect();
    format!("{head}_{}", &digest[..8])
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn vault_config(root: &Path) -> VaultConfig {
        VaultConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.md".into()],
            exclude_globs: vec![
                "**/.obsidian/**".into(),
                "**/templates/**".into(),
                "**/Archive/**".into(),
            ],
            follow_symlinks: false,
        }
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_parse_note_hierarchy() {
        let doc = parse_note(
            Path::new("Spiritual/A New Earth/Chapter 1/Notes - Ego.md"),
            "See [[Pain-Body]] and [[Presence|being present]] and [[Pain-Body]].",
            Some(42),
        )
        .unwrap();
        assert_eq!(doc.title, "Ego");
        assert_eq!(doc.category, "Spiritual");
        assert_eq!(doc.book.as_deref(), Some("A New Earth"));
        assert_eq!(doc.chapter.as_deref(), Some("Chapter 1"));
        assert_eq!(doc.id, "spiritual_a-new-earth_chapter-1_notes-ego");
        let links: Vec<&str> = doc.outbound_links.iter().map(String::as_str).collect();
        assert_eq!(links, vec!["Pain-Body", "Presence"]);
        assert_eq!(doc.metadata.modified_at, Some(42));
    }

    #[test]
    fn test_root_note_is_general() {
        let doc = parse_note(Path::new("Inbox.md"), "loose thought", None).unwrap();
        assert_eq!(doc.category, DEFAULT_CATEGORY);
        assert_eq!(doc.book, None);
        assert_eq!(doc.id, "inbox");
    }

    #[test]
    fn test_empty_note_rejected() {
        let err = parse_note(Path::new("Spiritual/Empty.md"), "  \n ", None).unwrap_err();
        assert_eq!(err.path, "Spiritual/Empty.md");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("  The Power of Now: Part 1! "), "the-power-of-now-part-1");
        assert_eq!(slugify("Self-Help -- Habits"), "self-help-habits");
        assert_eq!(slugify("?!"), "");
    }

    #[test]
    fn test_long_ids_are_hashed() {
        let title = "word ".repeat(40);
        let id = document_id(["Philosophy", "Collected Essays", &title]);
        assert_eq!(id.chars().count(), TRUNCATED_ID_LEN + 9);
        assert_eq!(id, document_id(["Philosophy", "Collected Essays", &title]));
        assert_ne!(id, document_id(["Philosophy", "Other", &title]));
    }

    #[test]
    fn test_scan_applies_globs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "Spiritual/A New Earth/Notes - Ego.md", "ego body");
        write(root, "Psychology/Flow.md", "flow body");
        write(root, "Archive/Old.md", "old body");
        write(root, ".obsidian/workspace.md", "config");
        write(root, "Spiritual/image.png", "binary");
        write(root, "Spiritual/Blank.md", "");

        let scan = scan_vault(&vault_config(root)).unwrap();
        let paths: Vec<&str> = scan
            .documents
            .iter()
            .map(|d| d.metadata.source_path.as_str())
            .collect();
        assert_eq!(paths, vec!["Psychology/Flow.md", "Spiritual/A New Earth/Notes - Ego.md"]);
        assert_eq!(scan.failures.len(), 1);
    }

    #[test]
    fn test_distinct_paths_get_distinct_ids() {
        let id = |p: &str| parse_note(Path::new(p), "body", None).unwrap().id;
        assert_ne!(
            id("Spiritual/Book/Ch/Part1/Ego.md"),
            id("Spiritual/Book/Ch/Part2/Ego.md")
        );
        assert_ne!(id("Spiritual/Notes - Ego.md"), id("Spiritual/Ego.md"));
        assert_ne!(id("a_b.md"), id("a/b.md"));
    }

    #[test]
    fn test_scan_reports_colliding_ids() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "Psychology/Ego.md", "first");
        write(root, "Psychology/ego!.md", "second");

        let scan = scan_vault(&vault_config(root)).unwrap();
        assert_eq!(scan.documents.len(), 1);
        assert_eq!(scan.documents[0].metadata.source_path, "Psychology/Ego.md");
        assert_eq!(scan.failures.len(), 1);
        assert_eq!(scan.failures[0].path, "Psychology/ego!.md");
        assert!(scan.failures[0].reason.contains("psychology_ego"));
    }

    #[test]
    fn test_missing_root_is_error() {
        let config = vault_config(Path::new("/nonexistent/vault/root"));
        assert!(scan_vault(&config).is_err());
    }
}
