//! Attachment filtering
//!
//! Builds a predicate from caller-supplied constraints. Filename constraints
//! are AND'ed with each other and with the content-type constraint. The
//! filter is compiled before any mailbox access so a bad pattern fails the
//! request up front.

use regex::{Regex, RegexBuilder};

use crate::errors::{AppError, AppResult};
use crate::mime::AttachmentEntry;
use crate::models::AttachmentFilterInput;

/// Compiled attachment filter
#[derive(Debug, Clone)]
pub struct AttachmentFilter {
    exact_name: Option<String>,
    name_contains: Option<String>,
    pattern: Option<Regex>,
    content_types: Vec<ContentTypeMatcher>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ContentTypeMatcher {
    Any,
    Exact(String),
    /// `image/*` is stored as `image/`
    Prefix(String),
}

impl ContentTypeMatcher {
    fn parse(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        if lowered == "*" || lowered == "*/*" {
            return Self::Any;
        }
        match lowered.strip_suffix('*') {
            Some(prefix) if prefix.ends_with('/') => Self::Prefix(prefix.to_owned()),
            _ => Self::Exact(lowered),
        }
    }

    fn matches(&self, content_type: &str) -> bool {
        let ctype = content_type.trim().to_ascii_lowercase();
        match self {
            Self::Any => true,
            Self::Exact(expected) => ctype == *expected,
            Self::Prefix(prefix) => ctype.starts_with(prefix.as_str()),
        }
    }
}

impl AttachmentFilter {
    /// Compile the caller's filter
    ///
    /// Returns `None` when nothing is configured, which means "match all".
    ///
    /// # Errors
    ///
    /// - `InvalidFilter` if the pattern does not compile or a flag is unknown
    pub fn compile(input: Option<&AttachmentFilterInput>) -> AppResult<Option<Self>> {
        let Some(input) = input else {
            return Ok(None);
        };

        let pattern = match &input.filename_pattern {
            Some(source) => Some(compile_pattern(source, input.pattern_flags.as_deref())?),
            None if input.pattern_flags.is_some() => {
                return Err(AppError::InvalidFilter(
                    "pattern_flags requires filename_pattern".to_owned(),
                ));
            }
            None => None,
        };

        let filter = Self {
            exact_name: input.filename.as_ref().map(|n| n.to_lowercase()),
            name_contains: input.filename_contains.as_ref().map(|n| n.to_lowercase()),
            pattern,
            content_types: input
                .content_types
                .iter()
                .flatten()
                .map(|c| ContentTypeMatcher::parse(c))
                .collect(),
        };

        if filter.is_empty() {
            Ok(None)
        } else {
            Ok(Some(filter))
        }
    }

    fn is_empty(&self) -> bool {
        self.exact_name.is_none()
            && self.name_contains.is_none()
            && self.pattern.is_none()
            && self.content_types.is_empty()
    }

    fn has_filename_constraint(&self) -> bool {
        self.exact_name.is_some() || self.name_contains.is_some() || self.pattern.is_some()
    }

    /// Whether a single entry satisfies every configured constraint
    pub fn matches(&self, entry: &AttachmentEntry) -> bool {
        if self.has_filename_constraint() {
            let Some(filename) = entry.filename.as_deref() else {
                return false;
            };
            let lowered = filename.to_lowercase();
            if self.exact_name.as_ref().is_some_and(|name| lowered != *name) {
                return false;
            }
            if self
                .name_contains
                .as_ref()
                .is_some_and(|needle| !lowered.contains(needle.as_str()))
            {
                return false;
            }
            if self.pattern.as_ref().is_some_and(|re| !re.is_match(filename)) {
                return false;
            }
        }

        self.content_types.is_empty()
            || self
                .content_types
                .iter()
                .any(|matcher| matcher.matches(&entry.content_type))
    }
}

/// Keep matching entries, preserving order; `None` keeps everything
pub fn select<'a>(
    filter: Option<&AttachmentFilter>,
    entries: &'a [AttachmentEntry],
) -> Vec<&'a AttachmentEntry> {
    entries
        .iter()
        .filter(|entry| filter.is_none_or(|f| f.matches(entry)))
        .collect()
}

/// Compile a filename pattern with caller flags
///
/// Accepted flags: `i` (case-insensitive), `m` (multi-line), `s` (dot matches
/// newline), `x` (ignore whitespace), `u` (unicode, always on). `g` is
/// accepted and ignored since matching is a yes/no test.
fn compile_pattern(source: &str, flags: Option<&str>) -> AppResult<Regex> {
    let mut builder = RegexBuilder::new(source);
    for flag in flags.unwrap_or_default().chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            'u' | 'g' => &mut builder,
            other => {
                return Err(AppError::InvalidFilter(format!(
                    "unsupported pattern flag '{other}'"
                )));
            }
        };
    }
    builder
        .build()
        .map_err(|e| AppError::InvalidFilter(format!("filename_pattern does not compile: {e}")))
}
