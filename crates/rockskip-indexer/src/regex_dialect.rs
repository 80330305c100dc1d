//! Rewrites search patterns into PostgreSQL advanced regular expressions so
//! a pattern matches the same symbols in either store.
//!
//! Accepted: literals and escapes, `.`, `\d \s \w` and their negations,
//! bracket classes with ranges and `[:ascii:]` names, groups (a named group
//! loses its name), alternation, greedy and lazy repetition, `^ $ \A \z`,
//! `\b \B`, and a single leading `(?i)`. Unicode classes, other inline
//! flags, nested classes, class set operations and the newer word boundary
//! forms are rejected as invalid patterns.

use regex_syntax::ast::{self, Ast, Visitor, parse::Parser};

/// The PostgreSQL spelling of `pattern`, or an error when it uses syntax
/// without an equivalent there.
pub fn to_postgres(pattern: &str) -> Result<String, regex::Error> {
    let ast = Parser::new()
        .parse(pattern)
        .map_err(|err| regex::Error::Syntax(err.to_string()))?;
    let edits = ast::visit(
        &ast,
        Translator {
            pattern,
            edits: Vec::new(),
        },
    )?;

    let mut out = String::with_capacity(pattern.len());
    let mut at = 0;
    for edit in edits {
        out.push_str(&pattern[at..edit.start]);
        out.push_str(&edit.text);
        at = edit.end;
    }
    out.push_str(&pattern[at..]);
    Ok(out)
}

fn unsupported(what: &str) -> regex::Error {
    regex::Error::Syntax(format!("{what} not supported in search patterns"))
}

/// Replacement of `pattern[start..end]`.
struct Edit {
    start: usize,
    end: usize,
    text: String,
}

struct Translator<'p> {
    pattern: &'p str,
    edits: Vec<Edit>,
}

impl Translator<'_> {
    fn replace(&mut self, span: &ast::Span, text: impl Into<String>) {
        self.edits.push(Edit {
            start: span.start.offset,
            end: span.end.offset,
            text: text.into(),
        });
    }

    /// Escapes are spelled differently (`\x{e9}`, `\x7F`), so every escaped
    /// literal is rewritten in a form both dialects read the same way.
    fn literal(&mut self, literal: &ast::Literal) {
        if literal.kind != ast::LiteralKind::Verbatim {
            self.replace(&literal.span, render(literal.c));
        }
    }
}

fn render(c: char) -> String {
    if c.is_ascii_alphanumeric() {
        c.to_string()
    } else if c.is_ascii_punctuation() {
        format!("\\{c}")
    } else if u32::from(c) <= 0xFFFF {
        format!("\\u{:04x}", u32::from(c))
    } else {
        format!("\\U{:08x}", u32::from(c))
    }
}

impl Visitor for Translator<'_> {
    type Output = Vec<Edit>;
    type Err = regex::Error;

    fn finish(mut self) -> Result<Vec<Edit>, regex::Error> {
        self.edits.sort_by_key(|edit| edit.start);
        Ok(self.edits)
    }

    fn visit_pre(&mut self, ast: &Ast) -> Result<(), regex::Error> {
        match ast {
            Ast::Flags(set) => {
                let leading_case_insensitive = set.span.start.offset == 0
                    && matches!(
                        set.flags.items.as_slice(),
                        [item] if item.kind == ast::FlagsItemKind::Flag(ast::Flag::CaseInsensitive)
                    );
                if !leading_case_insensitive {
                    return Err(unsupported("inline flags other than a leading (?i) are"));
                }
            }
            Ast::Literal(literal) => self.literal(literal),
            Ast::Assertion(assertion) => {
                let text = match assertion.kind {
                    ast::AssertionKind::StartLine | ast::AssertionKind::StartText => "^",
                    ast::AssertionKind::EndLine | ast::AssertionKind::EndText => "$",
                    ast::AssertionKind::WordBoundary => "\\y",
                    ast::AssertionKind::NotWordBoundary => "\\Y",
                    _ => return Err(unsupported("this word boundary is")),
                };
                self.replace(&assertion.span, text);
            }
            Ast::ClassUnicode(_) => return Err(unsupported("Unicode classes are")),
            Ast::Group(group) => match &group.kind {
                ast::GroupKind::CaptureIndex(_) => {}
                ast::GroupKind::NonCapturing(flags) => {
                    if !flags.items.is_empty() {
                        return Err(unsupported("flags on groups are"));
                    }
                }
                _ => {
                    // `(?P<name>` or `(?<name>` becomes `(`.
                    let start = group.span.start.offset;
                    let end = self.pattern[start..]
                        .find('>')
                        .map(|close| start + close + 1)
                        .ok_or_else(|| unsupported("this group syntax is"))?;
                    self.edits.push(Edit {
                        start,
                        end,
                        text: "(".to_string(),
                    });
                }
            },
            _ => {}
        }
        Ok(())
    }

    fn visit_class_set_item_pre(&mut self, item: &ast::ClassSetItem) -> Result<(), regex::Error> {
        match item {
            ast::ClassSetItem::Literal(literal) => self.literal(literal),
            ast::ClassSetItem::Range(range) => {
                self.literal(&range.start);
                self.literal(&range.end);
            }
            ast::ClassSetItem::Unicode(_) => return Err(unsupported("Unicode classes are")),
            ast::ClassSetItem::Perl(perl) if perl.negated => {
                return Err(unsupported("negated classes inside brackets are"));
            }
            ast::ClassSetItem::Bracketed(_) => return Err(unsupported("nested classes are")),
            _ => {}
        }
        Ok(())
    }

    fn visit_class_set_binary_op_pre(&mut self, _op: &ast::ClassSetBinaryOp) -> Result<(), regex::Error> {
        Err(unsupported("class set operations are"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translated(pattern: &str) -> String {
        to_postgres(pattern).unwrap()
    }

    #[test]
    fn common_patterns_pass_through() {
        for pattern in ["^Foo$", "foo.*bar", "\\.go$", "(a|b)+?", "[a-z_][[:alnum:]]{2,}", "\\d+\\s\\W"] {
            assert_eq!(translated(pattern), pattern);
        }
    }

    #[test]
    fn assertions_use_postgres_spellings() {
        assert_eq!(translated("\\bfoo\\B"), "\\yfoo\\Y");
        assert_eq!(translated("\\Afoo\\z"), "^foo$");
    }

    #[test]
    fn named_groups_lose_their_names() {
        assert_eq!(translated("(?P<kind>get|set)_(?<rest>\\w+)"), "(get|set)_(\\w+)");
    }

    #[test]
    fn escapes_are_rewritten() {
        assert_eq!(translated("\\x{e9}t\\x41"), "\\u00e9tA");
        assert_eq!(translated("a\\tb"), "a\\u0009b");
        assert_eq!(translated("[\\x{1F600}-\\x{1F64F}]"), "[\\U0001f600-\\U0001f64f]");
        // regex::escape output stays literal.
        let escaped = regex::escape("a.b-c#d(e)");
        assert_eq!(translated(&escaped), escaped);
    }

    #[test]
    fn leading_case_flag_is_kept() {
        assert_eq!(translated("(?i)foo"), "(?i)foo");
    }

    #[test]
    fn constructs_without_an_equivalent_are_rejected() {
        for pattern in [
            "a(?i)b",
            "(?s).",
            "(?i:foo)",
            "\\pL+",
            "\\p{Greek}",
            "[\\p{L}]",
            "[a-z&&[^aeiou]]",
            "[[:alpha:][0-9]]x[a[b]]",
            "[\\D]",
            "\\b{start}foo",
        ] {
            assert!(to_postgres(pattern).is_err(), "{pattern} should be rejected");
        }
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(to_postgres("(unclosed"), Err(regex::Error::Syntax(_))));
    }
}
