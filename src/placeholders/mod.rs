//! Named-parameter scanning for statement templates.
//!
//! Templates declare parameters as `:name`. Scanning is purely lexical and performs no I/O: it
//! skips quoted strings and identifiers, comments, and `::` casts, records each distinct name in
//! order of first appearance, and rewrites the SQL into the positional `?N` form drivers receive.

mod scanner;

use scanner::{State, is_block_comment_end, is_block_comment_start, is_line_comment_start, scan_ident};

/// A statement template after parameter discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSql {
    /// The text the caller wrote.
    pub original: String,
    /// The text handed to drivers, with `:name` rewritten to `?N`.
    pub native: String,
    /// Declared parameter names; index `i` is bound to `?{i + 1}`.
    pub params: Vec<String>,
}

impl ParsedSql {
    /// Position of a declared parameter.
    #[must_use]
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p == name)
    }
}

/// Discover `:name` parameters and produce the positional form.
///
/// ```rust
/// use sql_session::placeholders::parse_named;
///
/// let parsed = parse_named("select * from t where a = :a and b = :b or a = :a");
/// assert_eq!(parsed.params, ["a", "b"]);
/// assert_eq!(parsed.native, "select * from t where a = ?1 and b = ?2 or a = ?1");
/// ```
#[must_use]
pub fn parse_named(sql: &str) -> ParsedSql {
    let mut native = String::with_capacity(sql.len());
    let mut params: Vec<String> = Vec::new();
    let mut state = State::Normal;
    let mut idx = 0;
    let mut copied_to = 0;
    let bytes = sql.as_bytes();

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::Normal => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                b'`' => state = State::BacktickQuoted,
                b'[' => state = State::BracketQuoted,
                _ if is_line_comment_start(bytes, idx) => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => {
                    state = State::BlockComment(1);
                    idx += 1;
                }
                b':' if bytes.get(idx + 1) == Some(&b':') => {
                    idx += 1; // cast operator
                }
                b':' => {
                    if let Some((end, name)) = scan_ident(bytes, idx + 1) {
                        let position = match params.iter().position(|p| p == name) {
                            Some(pos) => pos,
                            None => {
                                params.push(name.to_string());
                                params.len() - 1
                            }
                        };
                        native.push_str(&sql[copied_to..idx]);
                        native.push('?');
                        native.push_str(&(position + 1).to_string());
                        copied_to = end;
                        idx = end;
                        continue;
                    }
                }
                _ => {}
            },
            State::SingleQuoted => {
                if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::BacktickQuoted => {
                if b == b'`' {
                    state = State::Normal;
                }
            }
            State::BracketQuoted => {
                if b == b']' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                    idx += 1;
                } else if is_block_comment_end(bytes, idx) {
                    idx += 1;
                    if depth == 1 {
                        state = State::Normal;
                    } else {
                        state = State::BlockComment(depth - 1);
                    }
                }
            }
        }
        idx += 1;
    }

    native.push_str(&sql[copied_to..]);
    ParsedSql {
        original: sql.to_string(),
        native,
        params,
    }
}

/// First keyword of a statement, upper-cased, skipping whitespace and comments.
#[must_use]
pub fn leading_keyword(sql: &str) -> Option<String> {
    let bytes = sql.as_bytes();
    let mut idx = 0;
    loop {
        while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if is_line_comment_start(bytes, idx) {
            while idx < bytes.len() && bytes[idx] != b'\n' {
                idx += 1;
            }
        } else if is_block_comment_start(bytes, idx) {
            idx += 2;
            while idx < bytes.len() && !is_block_comment_end(bytes, idx) {
                idx += 1;
            }
            idx += 2;
        } else {
            break;
        }
    }
    scan_ident(bytes, idx.min(bytes.len())).map(|(_, word)| word.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_distinct_names_in_order() {
        let parsed = parse_named("insert into t (a, b) values (:b, :a)");
        assert_eq!(parsed.params, ["b", "a"]);
        assert_eq!(parsed.native, "insert into t (a, b) values (?1, ?2)");
        assert_eq!(parsed.position_of("a"), Some(1));
    }

    #[test]
    fn skips_inside_literals_and_comments() {
        let sql = "select ':x', \":y\" -- :z\n/* :w */ from t where a = :real";
        let parsed = parse_named(sql);
        assert_eq!(parsed.params, ["real"]);
        assert_eq!(
            parsed.native,
            "select ':x', \":y\" -- :z\n/* :w */ from t where a = ?1"
        );
    }

    #[test]
    fn ignores_casts_and_bare_colons() {
        let parsed = parse_named("select a::text, ': ' from t where b = :b and c = : d");
        assert_eq!(parsed.params, ["b"]);
        assert_eq!(
            parsed.native,
            "select a::text, ': ' from t where b = ?1 and c = : d"
        );
    }

    #[test]
    fn handles_escaped_quotes_and_nested_comments() {
        let parsed = parse_named("select 'it''s :no' /* a /* :no */ b */, :yes");
        assert_eq!(parsed.params, ["yes"]);
        assert_eq!(parsed.native, "select 'it''s :no' /* a /* :no */ b */, ?1");
    }

    #[test]
    fn statement_without_params_is_unchanged() {
        let parsed = parse_named("select 1");
        assert!(parsed.params.is_empty());
        assert_eq!(parsed.native, "select 1");
    }

    #[test]
    fn leading_keyword_skips_comments() {
        assert_eq!(leading_keyword("  -- hi\n /* x */ begin;").as_deref(), Some("BEGIN"));
        assert_eq!(leading_keyword("Select 1").as_deref(), Some("SELECT"));
        assert_eq!(leading_keyword("   "), None);
    }
}
