//! Read-Only Query Validation
//!
//! This module decides whether a candidate SQL string may be executed.
//! askdb is read-only: only a single `SELECT` statement, or a `WITH ... SELECT`
//! common-table-expression query, is ever accepted.
//!
//! # Validation Strategy
//! - Tokenize first, then classify. String literals, quoted identifiers and
//!   comments are opaque, so keywords inside them never count.
//! - Conservative approach (fail-safe defaults): if two SQL dialects would
//!   disagree on where a literal or comment ends, the query is rejected.
//!   Line comments that only some dialects honour (`#`, `--x`) are read as
//!   code, so anything they hide is still checked.
//! - Stacked statements are rejected; a trailing `;` is tolerated.
//! - Denylisted verbs are rejected wherever they appear as bare keywords,
//!   which also covers data-modifying CTEs such as `WITH x AS (DELETE ...)`.
//! - `WITH` queries are parsed far enough to confirm that every CTE body and
//!   the terminal statement are `SELECT`s.
//!
//! Validation is pure: it never fails with an error, it returns a [`Verdict`].

use serde::Serialize;
use std::fmt;

use crate::error::{AskError, Result};

/// Statement verbs that are never allowed
pub const DENIED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "MERGE", "EXEC", "EXECUTE",
    "CREATE", "GRANT", "REVOKE",
];

/// Outcome of validating a candidate query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "lowercase")]
pub enum Verdict {
    /// The query is a single read-only SELECT
    Accepted,
    /// The query may not run; the reason is suitable for feeding back to the model
    Rejected(String),
}

impl Verdict {
    /// Whether the query may be executed
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// The rejection reason, if any
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Accepted => None,
            Self::Rejected(reason) => Some(reason),
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

/// Validate that `sql` is a single read-only SELECT statement
#[must_use]
pub fn validate(sql: &str) -> Verdict {
    let tokens = match tokenize(sql) {
        Ok(tokens) => tokens,
        Err(reason) => return Verdict::rejected(reason),
    };

    let statement = match single_statement(&tokens) {
        Ok(statement) => statement,
        Err(reason) => return Verdict::rejected(reason),
    };

    if let Some(verb) = statement.iter().find_map(|t| t.word().filter(|w| is_denied(w))) {
        return Verdict::rejected(format!("disallowed statement: {verb}"));
    }

    if statement.iter().any(|t| t.is_word("INTO")) {
        return Verdict::rejected("disallowed clause: INTO");
    }

    classify(statement)
}

/// Validate and convert a rejection into an error
///
/// Used by the engines as a last check before anything reaches the database.
pub fn ensure_read_only(sql: &str) -> Result<()> {
    match validate(sql) {
        Verdict::Accepted => Ok(()),
        Verdict::Rejected(reason) => {
            tracing::warn!(%reason, "refusing to execute rejected query");
            Err(AskError::validation_rejected(reason))
        }
    }
}

fn is_denied(word: &str) -> bool {
    DENIED_KEYWORDS.iter().any(|denied| *denied == word)
}

/// Lexical token; only what classification needs is kept
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Bare word, uppercased (keywords, unquoted identifiers, numbers, variables)
    Word(String),
    /// String literal or quoted identifier (contents are irrelevant)
    Quoted,
    Open,
    Close,
    Comma,
    Semicolon,
    Symbol(char),
}

impl Token {
    fn word(&self) -> Option<&str> {
        match self {
            Self::Word(w) => Some(w),
            _ => None,
        }
    }

    fn is_word(&self, keyword: &str) -> bool {
        self.word() == Some(keyword)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Word(w) => write!(f, "{w}"),
            Self::Quoted => write!(f, "quoted text"),
            Self::Open => write!(f, "("),
            Self::Close => write!(f, ")"),
            Self::Comma => write!(f, ","),
            Self::Semicolon => write!(f, ";"),
            Self::Symbol(c) => write!(f, "{c}"),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '$' | '@')
}

/// Split SQL text into tokens, dropping whitespace and comments
fn tokenize(sql: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = sql.chars().collect();
    tokenize_chars(&chars)
}

fn tokenize_chars(chars: &[char]) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match c {
            _ if c.is_whitespace() => i += 1,

            '-' if next == Some('-')
                && chars.get(i + 2).map_or(true, |c| c.is_whitespace()) =>
            {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }

            // `--x` is a comment everywhere except MySQL, and `#` is a comment
            // only in MySQL. The rest of the line is kept as code and has to
            // lex the same under both readings.
            '-' if next == Some('-') => {
                tokens.push(Token::Symbol('-'));
                tokens.push(Token::Symbol('-'));
                i = line_as_code(chars, i + 2, &mut tokens)?;
            }
            '#' => {
                tokens.push(Token::Symbol('#'));
                i = line_as_code(chars, i + 1, &mut tokens)?;
            }

            '/' if next == Some('*') => {
                // `/*! ... */` is executed by MySQL, keep scanning its contents as code
                if chars.get(i + 2) == Some(&'!') {
                    i += 3;
                    continue;
                }
                let end = (i + 2..chars.len().saturating_sub(1))
                    .find(|&j| chars[j] == '*' && chars[j + 1] == '/')
                    .ok_or_else(|| "unterminated string literal or comment".to_string())?;
                i = end + 2;
            }

            '\'' | '"' => {
                i = skip_quoted(chars, i, c)?;
                tokens.push(Token::Quoted);
            }

            '`' => {
                i = skip_doubled(chars, i, '`')
                    .ok_or_else(|| "unterminated string literal or comment".to_string())?;
                tokens.push(Token::Quoted);
            }

            '[' => {
                let end = skip_doubled(chars, i, ']')
                    .ok_or_else(|| "unterminated string literal or comment".to_string())?;
                if chars[i..end].contains(&';') {
                    return Err("ambiguous bracketed identifier".to_string());
                }
                i = end;
                tokens.push(Token::Quoted);
            }

            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }

            _ if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Word(word.to_uppercase()));
            }

            _ => {
                tokens.push(Token::Symbol(c));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

/// Tokenize `chars[start..]` up to the end of the line, returning the newline's index
///
/// Fails when a literal or comment opened on this line would run past it,
/// since a dialect that reads the line as a comment would then see different
/// statements after the newline.
fn line_as_code(
    chars: &[char],
    start: usize,
    tokens: &mut Vec<Token>,
) -> std::result::Result<usize, String> {
    let end = chars[start..].iter().position(|&c| c == '\n').map_or(chars.len(), |p| start + p);
    let code =
        tokenize_chars(&chars[start..end]).map_err(|_| "ambiguous line comment".to_string())?;
    tokens.extend(code);
    Ok(end)
}

/// Skip a `'...'` or `"..."` run starting at `start`, returning the index after it
///
/// Standard SQL only escapes a quote by doubling it, while MySQL (and
/// PostgreSQL `E'...'` strings) also honour backslash escapes. Both readings
/// are computed and the literal is only accepted when they agree.
fn skip_quoted(chars: &[char], start: usize, quote: char) -> std::result::Result<usize, String> {
    let standard = skip_doubled(chars, start, quote);
    let backslash = skip_backslash_escaped(chars, start, quote);

    match (standard, backslash) {
        (Some(a), Some(b)) if a == b => Ok(a),
        (None, None) => Err("unterminated string literal or comment".to_string()),
        _ => Err("ambiguous string literal escape".to_string()),
    }
}

/// Quote run where the closing character is escaped by doubling it
fn skip_doubled(chars: &[char], start: usize, close: char) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == close {
            if chars.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

fn skip_backslash_escaped(chars: &[char], start: usize, quote: char) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote => {
                if chars.get(i + 1) == Some(&quote) {
                    i += 2;
                    continue;
                }
                return Some(i + 1);
            }
            _ => i += 1,
        }
    }
    None
}

/// Return the only non-empty statement, rejecting stacked queries
fn single_statement(tokens: &[Token]) -> std::result::Result<&[Token], String> {
    let mut statements = tokens.split(|t| *t == Token::Semicolon).filter(|s| !s.is_empty());

    let first = statements.next().ok_or_else(|| "empty query".to_string())?;
    if statements.next().is_some() {
        return Err("multiple statements not allowed".to_string());
    }
    Ok(first)
}

fn skip_open(tokens: &[Token]) -> &[Token] {
    let start = tokens.iter().position(|t| *t != Token::Open).unwrap_or(tokens.len());
    &tokens[start..]
}

/// Classify a single statement by its leading keyword
fn classify(statement: &[Token]) -> Verdict {
    let body = skip_open(statement);
    match body.first() {
        Some(t) if t.is_word("SELECT") => Verdict::Accepted,
        Some(t) if t.is_word("WITH") => classify_with(&body[1..]),
        Some(t) => Verdict::rejected(format!("only SELECT statements are allowed, found: {t}")),
        None => Verdict::rejected("empty query"),
    }
}

/// Index of the `Close` matching the `Open` at `open`
fn matching_close(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        match token {
            Token::Open => depth += 1,
            Token::Close => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the CTE list following `WITH` and check the terminal statement
///
/// Grammar: `[RECURSIVE] name [(cols)] AS [NOT] [MATERIALIZED] (body) [, ...] terminal`
fn classify_with(tokens: &[Token]) -> Verdict {
    let malformed = || Verdict::rejected("malformed WITH clause");
    let mut i = usize::from(tokens.first().is_some_and(|t| t.is_word("RECURSIVE")));

    loop {
        match tokens.get(i) {
            Some(Token::Word(_) | Token::Quoted) => i += 1,
            _ => return malformed(),
        }

        if tokens.get(i) == Some(&Token::Open) {
            match matching_close(tokens, i) {
                Some(close) => i = close + 1,
                None => return malformed(),
            }
        }

        if !tokens.get(i).is_some_and(|t| t.is_word("AS")) {
            return malformed();
        }
        i += 1;
        if tokens.get(i).is_some_and(|t| t.is_word("NOT")) {
            i += 1;
        }
        if tokens.get(i).is_some_and(|t| t.is_word("MATERIALIZED")) {
            i += 1;
        }

        if tokens.get(i) != Some(&Token::Open) {
            return malformed();
        }
        let Some(close) = matching_close(tokens, i) else {
            return malformed();
        };

        let body = skip_open(&tokens[i + 1..close]);
        match body.first() {
            Some(t) if t.is_word("SELECT") => {}
            Some(t) if t.is_word("WITH") => {
                if let rejected @ Verdict::Rejected(_) = classify_with(&body[1..]) {
                    return rejected;
                }
            }
            _ => return Verdict::rejected("CTE body must be a SELECT"),
        }

        i = close + 1;
        if tokens.get(i) == Some(&Token::Comma) {
            i += 1;
            continue;
        }
        break;
    }

    match skip_open(&tokens[i..]).first() {
        Some(t) if t.is_word("SELECT") => Verdict::Accepted,
        _ => Verdict::rejected("WITH clause must end in a SELECT"),
    }
}
