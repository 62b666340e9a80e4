//! Ignore pattern matching for backup walks.
//!
//! Patterns support literal names, trailing-slash directory rules, globs
//! (`*`, `?`, character classes), absolute paths, and path-substring rules.
//! All comparisons are case-sensitive and forward-slash normalized. The
//! matcher also unconditionally excludes the destination store itself so a
//! backup can never recurse into its own output.

use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;
use tracing::warn;

/// Normalize a path to forward slashes for matching and manifest keys.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn is_absolute_pattern(pattern: &str) -> bool {
    if pattern.starts_with('/') {
        return true;
    }
    let bytes = pattern.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn build_glob(pattern: &str, literal_separator: bool) -> Option<GlobMatcher> {
    match GlobBuilder::new(pattern)
        .literal_separator(literal_separator)
        .build()
    {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(e) => {
            warn!("Ignoring invalid glob pattern '{}': {}", pattern, e);
            None
        }
    }
}

/// Surround a pattern with `*` wildcards, without doubling a star the
/// pattern already carries (`**` would not parse as a glob here).
fn wrap_stars(text: &str, leading: bool, trailing: bool) -> String {
    let mut pattern = String::new();
    if leading && !text.starts_with('*') {
        pattern.push('*');
    }
    pattern.push_str(text);
    if trailing && !text.ends_with('*') {
        pattern.push('*');
    }
    pattern
}

/// One ignore pattern, compiled once.
#[derive(Debug)]
struct CompiledPattern {
    /// Normalized pattern text, trailing slash stripped.
    text: String,
    /// Pattern ended with `/` and binds to directories only.
    dir_only: bool,
    absolute: bool,
    /// Glob used against basenames and individual path segments.
    name_glob: Option<GlobMatcher>,
    /// Glob used against the full path; `/` is a literal separator here.
    path_glob: Option<GlobMatcher>,
    /// `p/*`, `*/p`, `*p*` for patterns containing a slash.
    slash_variants: Vec<GlobMatcher>,
    /// `*p`, `p*`, `*p*` fallbacks, free to cross directory boundaries.
    loose_variants: Vec<GlobMatcher>,
}

impl CompiledPattern {
    fn compile(raw: &str) -> Self {
        let normalized = raw.replace('\\', "/");
        let dir_only = normalized.ends_with('/');
        let text = normalized.trim_end_matches('/').to_string();
        let absolute = is_absolute_pattern(&text);

        let name_glob = if text.is_empty() {
            None
        } else {
            build_glob(&text, false)
        };
        let path_glob = if text.is_empty() {
            None
        } else {
            build_glob(&text, true)
        };

        let slash_variants = if text.contains('/') {
            [
                format!("{}/*", text),
                format!("*/{}", text),
                wrap_stars(&text, true, true),
            ]
            .iter()
            .filter_map(|p| build_glob(p, false))
            .collect()
        } else {
            Vec::new()
        };

        let loose_variants = if text.is_empty() {
            Vec::new()
        } else {
            [
                wrap_stars(&text, true, false),
                wrap_stars(&text, false, true),
                wrap_stars(&text, true, true),
            ]
            .iter()
            .filter_map(|p| build_glob(p, false))
            .collect()
        };

        Self {
            text,
            dir_only,
            absolute,
            name_glob,
            path_glob,
            slash_variants,
            loose_variants,
        }
    }

    /// Staged evaluation; the first stage that matches excludes the path.
    fn matches(&self, full: &str, name: &str, is_dir: bool) -> bool {
        if self.text.is_empty() {
            return false;
        }

        if self.absolute && full == self.text {
            return true;
        }

        if self.dir_only {
            // The subtree check applies to files too, so anything beneath an
            // excluded directory stays excluded even without pruning.
            if full == self.text || full.starts_with(&format!("{}/", self.text)) {
                return true;
            }
            // Every remaining stage binds to directories only: `logs/` must
            // not exclude a plain file named `logs`.
            if !is_dir {
                return false;
            }
        }

        if let Some(glob) = &self.name_glob {
            if glob.is_match(name) {
                return true;
            }
            if full.split('/').any(|segment| glob.is_match(segment)) {
                return true;
            }
        }

        if let Some(glob) = &self.path_glob {
            if glob.is_match(full) {
                return true;
            }
        }

        if self.slash_variants.iter().any(|g| g.is_match(full)) {
            return true;
        }

        if full.contains(&self.text) {
            return true;
        }

        self.loose_variants.iter().any(|g| g.is_match(full))
    }
}

/// Decides whether a walked path is excluded from the backup.
#[derive(Debug)]
pub struct IgnoreMatcher {
    destination: String,
    patterns: Vec<CompiledPattern>,
}

impl IgnoreMatcher {
    /// Compile the pattern list. Invalid glob patterns lose their glob
    /// stages but keep the literal ones; they never fail the run.
    pub fn new(patterns: &[String], destination: &Path) -> Self {
        Self {
            destination: normalize_path(destination)
                .trim_end_matches('/')
                .to_string(),
            patterns: patterns
                .iter()
                .map(|p| CompiledPattern::compile(p))
                .collect(),
        }
    }

    /// Whether `path` must be excluded. Callers must prune the walk when an
    /// excluded path is a directory.
    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        let full = normalize_path(path);

        // Never back up the store we are writing into.
        if !self.destination.is_empty()
            && (full == self.destination
                || full.starts_with(&format!("{}/", self.destination)))
        {
            return true;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.patterns
            .iter()
            .any(|p| p.matches(&full, &name, is_dir))
    }
}
