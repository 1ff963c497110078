//! SQL statement splitter
//!
//! Turns a raw migration script into an ordered list of [`Statement`]s. This is a
//! single-pass character state machine, not a SQL grammar: it only knows enough
//! lexical structure (comments, string literals, quoted identifiers and
//! dollar-quoted bodies) to find the semicolons that really end a statement.
//!
//! Comments that stand on their own between statements are emitted as
//! [`StatementKind::Comment`] / [`StatementKind::BlockComment`] so directive
//! detection can inspect them. Comments inside a statement stay part of its text;
//! line comments that sit alone on their own line there are also listed in
//! [`Statement::line_comments`].

use thiserror::Error;

/// Position inside a script
///
/// `offset` is a byte offset; `line` and `column` are 1-based, with columns
/// counted in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl Location {
    fn start() -> Self {
        Self {
            offset: 0,
            line: 1,
            column: 1,
        }
    }
}

/// What a [`Statement`] holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// A standalone `-- ...` line comment
    Comment,
    /// A standalone `/* ... */` comment (possibly nested)
    BlockComment,
    /// Executable SQL
    Query,
}

/// A `-- ...` comment alone on its line inside a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineComment {
    pub text: String,
    pub location: Location,
}

/// A lexically complete fragment of a script
///
/// For queries, `content` is the trimmed statement text without its
/// terminating semicolon. `start` points at the first character of the
/// fragment and `end` just past its last character (the semicolon, when
/// there is one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub kind: StatementKind,
    pub content: String,
    pub start: Location,
    pub end: Location,
    /// Line comments standing alone on a line within a query, in source order
    pub line_comments: Vec<LineComment>,
}

impl Statement {
    pub fn is_query(&self) -> bool {
        self.kind == StatementKind::Query
    }

    pub fn is_comment(&self) -> bool {
        matches!(self.kind, StatementKind::Comment | StatementKind::BlockComment)
    }
}

/// The construct that was left open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated quoted identifier")]
    UnterminatedIdentifier,
    #[error("unterminated dollar-quoted string ${0}$")]
    UnterminatedDollarQuote(String),
    #[error("unterminated block comment")]
    UnterminatedBlockComment,
    #[error("script is not valid UTF-8")]
    InvalidUtf8,
}

/// Splitting failure, located at the position where the offending construct opened
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at line {}, column {}", .location.line, .location.column)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub location: Location,
}

impl ParseError {
    fn new(kind: ParseErrorKind, location: Location) -> Self {
        Self { kind, location }
    }
}

/// Split a script given as raw bytes
///
/// # Errors
///
/// Returns [`ParseErrorKind::InvalidUtf8`] (located at the first invalid byte) when
/// the bytes are not UTF-8, otherwise the same errors as [`split`].
pub fn split_bytes(script: &[u8]) -> Result<Vec<Statement>, ParseError> {
    match std::str::from_utf8(script) {
        Ok(text) => split(text),
        Err(e) => {
            let valid = &script[..e.valid_up_to()];
            // Valid prefix, so this cannot fail.
            let prefix = std::str::from_utf8(valid).unwrap_or_default();
            let mut cursor = Cursor::new(prefix);
            while cursor.bump().is_some() {}
            Err(ParseError::new(ParseErrorKind::InvalidUtf8, cursor.location()))
        }
    }
}

/// Split a script into statements
///
/// Statements are returned in source order. A semicolon only ends a statement
/// when it appears outside every comment, string, quoted identifier and
/// dollar-quoted body. A trailing statement without a semicolon is still
/// returned. Bare semicolons produce nothing.
///
/// # Errors
///
/// Any comment or quoting construct still open at end of input is an error
/// carrying the line and column where that construct began. Splitting is
/// all-or-nothing: no statements are returned on error.
///
/// # Example
///
/// ```
/// use lockstep::migration::splitter::split;
///
/// let statements = split("SELECT $tag$a;b$tag$; SELECT 1;").unwrap();
/// assert_eq!(statements.len(), 2);
/// assert_eq!(statements[0].content, "SELECT $tag$a;b$tag$");
/// ```
pub fn split(script: &str) -> Result<Vec<Statement>, ParseError> {
    let mut cursor = Cursor::new(script);
    let mut statements = Vec::new();
    let mut query_start: Option<Location> = None;
    let mut line_comments: Vec<LineComment> = Vec::new();

    while let Some(c) = cursor.peek(0) {
        if query_start.is_none() {
            if c.is_whitespace() || c == ';' {
                cursor.bump();
                continue;
            }
            if c == '-' && cursor.peek(1) == Some('-') {
                let start = cursor.location();
                cursor.skip_line_comment();
                statements.push(cursor.fragment(StatementKind::Comment, start));
                continue;
            }
            if c == '/' && cursor.peek(1) == Some('*') {
                let start = cursor.location();
                cursor.skip_block_comment()?;
                statements.push(cursor.fragment(StatementKind::BlockComment, start));
                continue;
            }
            query_start = Some(cursor.location());
        }

        match c {
            '-' if cursor.peek(1) == Some('-') => {
                let location = cursor.location();
                cursor.skip_line_comment();
                if alone_on_line(script, location.offset) {
                    line_comments.push(LineComment {
                        text: script[location.offset..cursor.location().offset]
                            .trim()
                            .to_string(),
                        location,
                    });
                }
            }
            '/' if cursor.peek(1) == Some('*') => cursor.skip_block_comment()?,
            '\'' => cursor.skip_string()?,
            '"' => cursor.skip_quoted_identifier()?,
            '$' => match cursor.dollar_tag() {
                Some(tag) => cursor.skip_dollar_quoted(&tag)?,
                None => {
                    cursor.bump();
                }
            },
            ';' => {
                let body_end = cursor.location();
                cursor.bump();
                if let Some(start) = query_start.take() {
                    let content = script[start.offset..body_end.offset].trim_end();
                    if !content.is_empty() {
                        statements.push(Statement {
                            kind: StatementKind::Query,
                            content: content.to_string(),
                            start,
                            end: cursor.location(),
                            line_comments: std::mem::take(&mut line_comments),
                        });
                    }
                }
            }
            _ => {
                cursor.bump();
            }
        }
    }

    if let Some(start) = query_start {
        let mut statement = cursor.fragment(StatementKind::Query, start);
        statement.line_comments = line_comments;
        statements.push(statement);
    }

    Ok(statements)
}

/// Whether only whitespace precedes `offset` on its line
fn alone_on_line(script: &str, offset: usize) -> bool {
    let line_start = script[..offset].rfind('\n').map_or(0, |i| i + 1);
    script[line_start..offset].trim().is_empty()
}

struct Cursor<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    line: usize,
    column: usize,
    /// Location just past the last non-whitespace character consumed
    last_significant: Location,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            pos: 0,
            line: 1,
            column: 1,
            last_significant: Location::start(),
        }
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|&(_, c)| c)
    }

    fn location(&self) -> Location {
        let offset = self
            .chars
            .get(self.pos)
            .map_or(self.src.len(), |&(offset, _)| offset);
        Location {
            offset,
            line: self.line,
            column: self.column,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek(0)?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        if !c.is_whitespace() {
            self.last_significant = self.location();
        }
        Some(c)
    }

    fn bump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.bump();
        }
    }

    /// Build a fragment from `start` up to the last significant character consumed
    fn fragment(&self, kind: StatementKind, start: Location) -> Statement {
        let end = self.last_significant;
        Statement {
            kind,
            content: self.src[start.offset..end.offset].trim().to_string(),
            start,
            end,
            line_comments: Vec::new(),
        }
    }

    /// Consume `--` through the end of the line, leaving the newline in place
    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), ParseError> {
        let start = self.location();
        self.bump_n(2);
        let mut depth = 1usize;
        loop {
            match (self.peek(0), self.peek(1)) {
                (None, _) => {
                    return Err(ParseError::new(
                        ParseErrorKind::UnterminatedBlockComment,
                        start,
                    ))
                }
                (Some('/'), Some('*')) => {
                    depth += 1;
                    self.bump_n(2);
                }
                (Some('*'), Some('/')) => {
                    self.bump_n(2);
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {
                    self.bump();
                }
            }
        }
    }

    /// `'...'` with `''` and backslash escapes taken literally
    fn skip_string(&mut self) -> Result<(), ParseError> {
        let start = self.location();
        self.bump();
        loop {
            match self.bump() {
                None => return Err(ParseError::new(ParseErrorKind::UnterminatedString, start)),
                Some('\\') => {
                    if self.bump().is_none() {
                        return Err(ParseError::new(ParseErrorKind::UnterminatedString, start));
                    }
                }
                Some('\'') => {
                    if self.peek(0) == Some('\'') {
                        self.bump();
                    } else {
                        return Ok(());
                    }
                }
                Some(_) => {}
            }
        }
    }

    fn skip_quoted_identifier(&mut self) -> Result<(), ParseError> {
        let start = self.location();
        self.bump();
        loop {
            match self.bump() {
                None => {
                    return Err(ParseError::new(
                        ParseErrorKind::UnterminatedIdentifier,
                        start,
                    ))
                }
                Some('"') => {
                    if self.peek(0) == Some('"') {
                        self.bump();
                    } else {
                        return Ok(());
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// Tag of a `$tag$` opener at the cursor, if the `$` starts one
    ///
    /// A `$` directly after an identifier character belongs to that identifier,
    /// and a tag cannot begin with a digit (so `$1` stays a parameter).
    fn dollar_tag(&self) -> Option<String> {
        if self.pos > 0 {
            let prev = self.chars[self.pos - 1].1;
            if prev.is_alphanumeric() || prev == '_' {
                return None;
            }
        }
        let mut tag = String::new();
        let mut ahead = 1;
        loop {
            match self.peek(ahead)? {
                '$' => return Some(tag),
                c if c.is_alphanumeric() || c == '_' => {
                    if tag.is_empty() && c.is_ascii_digit() {
                        return None;
                    }
                    tag.push(c);
                    ahead += 1;
                }
                _ => return None,
            }
        }
    }

    fn at_delimiter(&self, tag: &str) -> bool {
        if self.peek(0) != Some('$') {
            return false;
        }
        let mut ahead = 1;
        for expected in tag.chars() {
            if self.peek(ahead) != Some(expected) {
                return false;
            }
            ahead += 1;
        }
        self.peek(ahead) == Some('$')
    }

    fn skip_dollar_quoted(&mut self, tag: &str) -> Result<(), ParseError> {
        let start = self.location();
        let delimiter_len = tag.chars().count() + 2;
        self.bump_n(delimiter_len);
        loop {
            if self.peek(0).is_none() {
                return Err(ParseError::new(
                    ParseErrorKind::UnterminatedDollarQuote(tag.to_string()),
                    start,
                ));
            }
            if self.at_delimiter(tag) {
                self.bump_n(delimiter_len);
                return Ok(());
            }
            self.bump();
        }
    }
}
