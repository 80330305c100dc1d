//! Query planning: symbol-name and path patterns are rewritten into the most
//! selective predicate that preserves regex semantics, and only fall back to
//! a regex scan when no cheaper form applies.

use regex::{Regex, RegexBuilder};
use regex_syntax::hir::{Hir, HirKind, Look};
use serde::Serialize;

use crate::regex_dialect;

/// Column a pattern is matched against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Name,
    Path,
}

/// A planned match predicate over a single column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// `^literal$`
    Exact { value: String, case_sensitive: bool },
    /// `^literal`
    Prefix { value: String, case_sensitive: bool },
    /// `\.(ext1|ext2)$`, paths only.
    Extension {
        extensions: Vec<String>,
        case_sensitive: bool,
    },
    Regex { pattern: String, case_sensitive: bool },
}

impl Condition {
    /// Plan `pattern` for `field`. Empty patterns (and a bare `^`) match
    /// everything and produce no condition.
    pub fn plan(pattern: &str, field: Field, case_sensitive: bool) -> Option<Condition> {
        if pattern.is_empty() || pattern == "^" {
            return None;
        }

        if let Some((value, anchored_end)) = anchored_literal(pattern) {
            return Some(if anchored_end {
                Condition::Exact {
                    value,
                    case_sensitive,
                }
            } else {
                Condition::Prefix {
                    value,
                    case_sensitive,
                }
            });
        }

        if field == Field::Path {
            if let Some(extensions) = extension_set(pattern) {
                return Some(Condition::Extension {
                    extensions,
                    case_sensitive,
                });
            }
        }

        Some(Condition::Regex {
            pattern: pattern.to_string(),
            case_sensitive,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Condition::Exact { .. } => "exact",
            Condition::Prefix { .. } => "prefix",
            Condition::Extension { .. } => "extension",
            Condition::Regex { .. } => "regex",
        }
    }

    pub fn case_sensitive(&self) -> bool {
        match self {
            Condition::Exact { case_sensitive, .. }
            | Condition::Prefix { case_sensitive, .. }
            | Condition::Extension { case_sensitive, .. }
            | Condition::Regex { case_sensitive, .. } => *case_sensitive,
        }
    }

    /// Build an in-process evaluator with the same semantics as the SQL
    /// translation.
    pub fn compile(&self) -> Result<Matcher, regex::Error> {
        Ok(match self {
            Condition::Exact {
                value,
                case_sensitive,
            } => Matcher::Exact(fold(value, *case_sensitive), *case_sensitive),
            Condition::Prefix {
                value,
                case_sensitive,
            } => Matcher::Prefix(fold(value, *case_sensitive), *case_sensitive),
            Condition::Extension {
                extensions,
                case_sensitive,
            } => Matcher::Extension(
                extensions
                    .iter()
                    .map(|ext| fold(ext, *case_sensitive))
                    .collect(),
                *case_sensitive,
            ),
            Condition::Regex {
                pattern,
                case_sensitive,
            } => {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(!case_sensitive)
                    .build()?;
                // Reject what the SQL store could not evaluate identically.
                regex_dialect::to_postgres(pattern)?;
                Matcher::Regex(regex)
            }
        })
    }
}

/// Compiled form of a [`Condition`].
#[derive(Clone, Debug)]
pub enum Matcher {
    Exact(String, bool),
    Prefix(String, bool),
    Extension(Vec<String>, bool),
    Regex(Regex),
}

impl Matcher {
    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(expected, case_sensitive) => {
                fold(value, *case_sensitive) == *expected
            }
            Matcher::Prefix(prefix, case_sensitive) => {
                fold(value, *case_sensitive).starts_with(prefix.as_str())
            }
            Matcher::Extension(extensions, case_sensitive) => file_extension(value)
                .map(|ext| {
                    let ext = fold(ext, *case_sensitive);
                    extensions.iter().any(|candidate| *candidate == ext)
                })
                .unwrap_or(false),
            Matcher::Regex(regex) => regex.is_match(value),
        }
    }
}

/// The full set of predicates a symbol search applies to the symbol table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SymbolQuery {
    pub name: Option<Condition>,
    pub include: Vec<Condition>,
    pub exclude: Option<Condition>,
}

impl SymbolQuery {
    /// Plan a search. Non-regexp queries are escaped into a substring regex
    /// first so that both modes share the same planner.
    pub fn plan(
        query: &str,
        is_regexp: bool,
        case_sensitive: bool,
        include_patterns: &[String],
        exclude_pattern: &str,
    ) -> Self {
        let name_pattern = if is_regexp {
            query.to_string()
        } else {
            regex::escape(query)
        };
        Self {
            name: Condition::plan(&name_pattern, Field::Name, case_sensitive),
            include: include_patterns
                .iter()
                .filter_map(|pattern| Condition::plan(pattern, Field::Path, case_sensitive))
                .collect(),
            exclude: Condition::plan(exclude_pattern, Field::Path, case_sensitive),
        }
    }

    pub fn compile(&self) -> Result<CompiledQuery, regex::Error> {
        Ok(CompiledQuery {
            name: self.name.as_ref().map(Condition::compile).transpose()?,
            include: self
                .include
                .iter()
                .map(Condition::compile)
                .collect::<Result<_, _>>()?,
            exclude: self.exclude.as_ref().map(Condition::compile).transpose()?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct CompiledQuery {
    pub name: Option<Matcher>,
    pub include: Vec<Matcher>,
    pub exclude: Option<Matcher>,
}

impl CompiledQuery {
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.as_ref().is_none_or(|m| m.is_match(name))
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.include.iter().all(|m| m.is_match(path))
            && !self.exclude.as_ref().is_some_and(|m| m.is_match(path))
    }
}

/// Extension of the final path component, as `get_file_extension` computes
/// it in SQL: everything after the last `.` of the path, when that `.` is
/// not followed by a `/`.
pub fn file_extension(path: &str) -> Option<&str> {
    let (_, ext) = path.rsplit_once('.')?;
    if ext.contains('/') { None } else { Some(ext) }
}

/// Escape `%`, `_` and `\` for use inside a LIKE pattern.
pub fn like_escape(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn fold(value: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        value.to_string()
    } else {
        value.to_lowercase()
    }
}

/// `^literal$` yields `(literal, true)`, `^literal` yields `(literal, false)`.
fn anchored_literal(pattern: &str) -> Option<(String, bool)> {
    let hir = regex_syntax::Parser::new().parse(pattern).ok()?;
    let HirKind::Concat(parts) = hir.kind() else {
        return None;
    };
    match parts.as_slice() {
        [start, literal, end] if is_start(start) && is_end(end) => {
            literal_text(literal).map(|text| (text, true))
        }
        [start, literal] if is_start(start) => literal_text(literal).map(|text| (text, false)),
        _ => None,
    }
}

fn is_start(hir: &Hir) -> bool {
    matches!(hir.kind(), HirKind::Look(Look::Start | Look::StartLF))
}

fn is_end(hir: &Hir) -> bool {
    matches!(hir.kind(), HirKind::Look(Look::End | Look::EndLF))
}

fn literal_text(hir: &Hir) -> Option<String> {
    match hir.kind() {
        HirKind::Literal(literal) => std::str::from_utf8(&literal.0).ok().map(str::to_string),
        _ => None,
    }
}

/// `\.go$`, `\.(go|ts)$` and `\.(?:go|ts)$` yield their extension lists.
fn extension_set(pattern: &str) -> Option<Vec<String>> {
    let inner = pattern.strip_prefix(r"\.")?.strip_suffix('$')?;
    let inner = match inner.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(group) => group.strip_prefix("?:").unwrap_or(group),
        None if inner.contains('|') => return None,
        None => inner,
    };
    let extensions: Vec<String> = inner.split('|').map(str::to_string).collect();
    let valid = extensions
        .iter()
        .all(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    valid.then_some(extensions)
}
