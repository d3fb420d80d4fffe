//! Multi-statement SQL scripts.
//!
//! A script is split on top-level semicolons. Semicolons inside string
//! literals, quoted identifiers and comments do not split. Statements that
//! contain nothing but whitespace or comments are skipped.
//!
//! Two statement forms are handled by the engine itself instead of being
//! passed to DuckDB:
//!
//! ```sql
//! CREATE TRACE VIEW name AS <select>;
//! CREATE TRACE TABLE name AS <select>;
//! ```
//!
//! Both replace any existing relation with the same name atomically.
//! `CREATE TRIGGER` is rejected outright.

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::schema::validate_identifier;

/// One statement of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement<'a> {
    /// Plain SQL handed to DuckDB.
    Sql {
        offset: usize,
        sql: &'a str,
        /// Lowercased first keyword, used to decide whether rows come back.
        keyword: String,
    },
    /// `CREATE TRACE VIEW name AS body`
    CreateView {
        offset: usize,
        name: String,
        body: &'a str,
    },
    /// `CREATE TRACE TABLE name AS body`
    CreateTable {
        offset: usize,
        name: String,
        body: &'a str,
    },
}

impl Statement<'_> {
    pub fn offset(&self) -> usize {
        match self {
            Statement::Sql { offset, .. }
            | Statement::CreateView { offset, .. }
            | Statement::CreateTable { offset, .. } => *offset,
        }
    }

    /// Whether executing the statement yields rows.
    pub fn returns_rows(&self) -> bool {
        match self {
            Statement::Sql { keyword, .. } => matches!(
                keyword.as_str(),
                "select"
                    | "with"
                    | "values"
                    | "from"
                    | "table"
                    | "pragma"
                    | "describe"
                    | "show"
                    | "explain"
                    | "summarize"
            ),
            _ => false,
        }
    }
}

/// Counters collected while running a script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    pub statement_count: u32,
    pub statement_count_with_output: u32,
    pub column_count: u32,
}

/// Column name that marks a row-returning statement as output-free.
pub const SUPPRESS_OUTPUT_COLUMN: &str = "suppress_query_output";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    Semi,
    Other,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            src: sql.as_bytes(),
            pos: 0,
        }
    }

    /// Next significant token, skipping whitespace and comments.
    fn next(&mut self) -> Result<Option<Token>> {
        loop {
            let Some(&c) = self.src.get(self.pos) else {
                return Ok(None);
            };
            let start = self.pos;
            match c {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                b'-' if self.peek(1) == Some(b'-') => {
                    while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.peek(1) == Some(b'*') => {
                    self.pos += 2;
                    while self.pos < self.src.len()
                        && !(self.src[self.pos] == b'*' && self.peek(1) == Some(b'/'))
                    {
                        self.pos += 1;
                    }
                    self.pos = (self.pos + 2).min(self.src.len());
                }
                b';' => {
                    self.pos += 1;
                    return Ok(Some(Token {
                        kind: TokenKind::Semi,
                        start,
                        end: self.pos,
                    }));
                }
                b'\'' | b'"' | b'`' => {
                    self.skip_quoted(c)?;
                    return Ok(Some(Token {
                        kind: TokenKind::Other,
                        start,
                        end: self.pos,
                    }));
                }
                c if c.is_ascii_alphabetic() || c == b'_' => {
                    while self
                        .src
                        .get(self.pos)
                        .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'$')
                    {
                        self.pos += 1;
                    }
                    return Ok(Some(Token {
                        kind: TokenKind::Word,
                        start,
                        end: self.pos,
                    }));
                }
                c if c >= 0x80 => {
                    while self.src.get(self.pos).is_some_and(|b| *b >= 0x80) {
                        self.pos += 1;
                    }
                    return Ok(Some(Token {
                        kind: TokenKind::Other,
                        start,
                        end: self.pos,
                    }));
                }
                _ => {
                    self.pos += 1;
                    return Ok(Some(Token {
                        kind: TokenKind::Other,
                        start,
                        end: self.pos,
                    }));
                }
            }
        }
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn skip_quoted(&mut self, quote: u8) -> Result<()> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.src.get(self.pos) {
                None => {
                    return Err(EngineError::Script {
                        offset: start,
                        message: "Unterminated quoted literal".to_string(),
                    })
                }
                Some(&b) if b == quote => {
                    // A doubled quote is an escaped quote.
                    if self.peek(1) == Some(quote) {
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        return Ok(());
                    }
                }
                Some(_) => self.pos += 1,
            }
        }
    }
}

/// Splits a script into statements.
pub struct ScriptParser<'a> {
    sql: &'a str,
    lexer: Lexer<'a>,
}

impl<'a> ScriptParser<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            lexer: Lexer::new(sql),
        }
    }

    /// Parse the next statement, or `None` at the end of the script.
    pub fn next_statement(&mut self) -> Result<Option<Statement<'a>>> {
        let mut tokens: Vec<Token> = Vec::new();
        loop {
            match self.lexer.next()? {
                None => break,
                Some(tok) if tok.kind == TokenKind::Semi => {
                    if tokens.is_empty() {
                        continue;
                    }
                    break;
                }
                Some(tok) => tokens.push(tok),
            }
        }

        let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
            return Ok(None);
        };
        let offset = first.start;
        let end = last.end;
        self.classify(&tokens, offset, end).map(Some)
    }

    fn word(&self, tok: Option<&Token>) -> Option<String> {
        tok.filter(|t| t.kind == TokenKind::Word)
            .map(|t| self.sql[t.start..t.end].to_ascii_lowercase())
    }

    fn classify(&self, tokens: &[Token], offset: usize, end: usize) -> Result<Statement<'a>> {
        let keyword = self.word(tokens.first()).unwrap_or_default();
        if keyword != "create" {
            return Ok(Statement::Sql {
                offset,
                sql: &self.sql[offset..end],
                keyword,
            });
        }

        let mut idx = 1;
        let mut second = self.word(tokens.get(idx));
        if matches!(second.as_deref(), Some("temp" | "temporary")) {
            idx += 1;
            second = self.word(tokens.get(idx));
        }
        match second.as_deref() {
            Some("trigger") => Err(EngineError::Script {
                offset: tokens[idx].start,
                message: "Creating triggers is not supported".to_string(),
            }),
            Some("trace") => self.parse_create_trace(tokens, offset, end),
            _ => Ok(Statement::Sql {
                offset,
                sql: &self.sql[offset..end],
                keyword,
            }),
        }
    }

    fn parse_create_trace(
        &self,
        tokens: &[Token],
        offset: usize,
        end: usize,
    ) -> Result<Statement<'a>> {
        let error_at = |idx: usize, message: String| EngineError::Script {
            offset: tokens.get(idx).map_or(end, |t| t.start),
            message,
        };

        let is_view = match self.word(tokens.get(2)).as_deref() {
            Some("view") => true,
            Some("table") => false,
            _ => {
                return Err(error_at(
                    2,
                    "Expected 'view' or 'table' after 'create trace'".to_string(),
                ))
            }
        };

        let name_tok = tokens
            .get(3)
            .filter(|t| t.kind == TokenKind::Word)
            .ok_or_else(|| error_at(3, "Expected a relation name".to_string()))?;
        let name = self.sql[name_tok.start..name_tok.end].to_string();
        validate_identifier(&name).map_err(|e| error_at(3, e.to_string()))?;

        if self.word(tokens.get(4)).as_deref() != Some("as") {
            return Err(error_at(4, "Expected keyword 'as'".to_string()));
        }
        let body_tok = tokens
            .get(5)
            .ok_or_else(|| error_at(5, "Expected a query after 'as'".to_string()))?;
        let body = &self.sql[body_tok.start..end];

        Ok(if is_view {
            Statement::CreateView { offset, name, body }
        } else {
            Statement::CreateTable { offset, name, body }
        })
    }
}

/// Split a whole script up front.
pub fn split_script(sql: &str) -> Result<Vec<Statement<'_>>> {
    let mut parser = ScriptParser::new(sql);
    let mut statements = Vec::new();
    while let Some(stmt) = parser.next_statement()? {
        statements.push(stmt);
    }
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqls<'a>(stmts: &[Statement<'a>]) -> Vec<&'a str> {
        stmts
            .iter()
            .map(|s| match s {
                Statement::Sql { sql, .. } => *sql,
                _ => panic!("expected plain sql"),
            })
            .collect()
    }

    #[test]
    fn test_empty() {
        assert!(split_script("").unwrap().is_empty());
        assert!(split_script("  ;  ; -- nothing\n /* here */").unwrap().is_empty());
    }

    #[test]
    fn test_multiple_statements() {
        let stmts = split_script("SELECT * FROM slices; SELECT * FROM s").unwrap();
        assert_eq!(sqls(&stmts), ["SELECT * FROM slices", "SELECT * FROM s"]);
        assert_eq!(stmts[1].offset(), 22);
    }

    #[test]
    fn test_ignore_only_space() {
        let stmts = split_script(" ; SELECT * FROM s; ; ;").unwrap();
        assert_eq!(sqls(&stmts), ["SELECT * FROM s"]);
        assert_eq!(stmts[0].offset(), 3);
    }

    #[test]
    fn test_semicolons_in_literals_and_comments() {
        let sql = "SELECT 'a;b', \"x;y\" FROM t -- c;d\n; /* e;f */ SELECT 2";
        let stmts = split_script(sql).unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(sqls(&stmts)[0], "SELECT 'a;b', \"x;y\" FROM t");
        assert_eq!(sqls(&stmts)[1], "SELECT 2");
    }

    #[test]
    fn test_escaped_quote() {
        let stmts = split_script("SELECT 'it''s;fine'; SELECT 1").unwrap();
        assert_eq!(sqls(&stmts), ["SELECT 'it''s;fine'", "SELECT 1"]);
    }

    #[test]
    fn test_unterminated_string() {
        let err = split_script("SELECT 'oops").unwrap_err();
        assert!(matches!(err, EngineError::Script { offset: 7, .. }));
    }

    #[test]
    fn test_create_trace_view() {
        let script = "create TRACE View busy AS select * from slices where dur > 0;";
        let stmts = split_script(script).unwrap();
        assert_eq!(
            stmts,
            [Statement::CreateView {
                offset: 0,
                name: "busy".to_string(),
                body: "select * from slices where dur > 0",
            }]
        );
    }

    #[test]
    fn test_create_trace_table() {
        let stmts = split_script("CREATE TRACE TABLE t AS SELECT 1 AS x").unwrap();
        assert!(matches!(&stmts[0], Statement::CreateTable { name, body, .. }
            if name == "t" && *body == "SELECT 1 AS x"));
    }

    #[test]
    fn test_create_trace_errors() {
        assert!(split_script("CREATE TRACE FUNCTION f AS SELECT 1").is_err());
        assert!(split_script("CREATE TRACE VIEW v SELECT 1").is_err());
        assert!(split_script("CREATE TRACE VIEW v AS").is_err());
        assert!(split_script("CREATE TRACE VIEW 'v' AS SELECT 1").is_err());
    }

    #[test]
    fn test_trigger_rejected() {
        let script = "SELECT 1; CREATE TRIGGER t AFTER INSERT ON s BEGIN SELECT 1; END";
        let err = split_script(script).unwrap_err();
        assert!(matches!(err, EngineError::Script { offset: 17, .. }));
        assert!(split_script("create temp trigger t").is_err());
    }

    #[test]
    fn test_plain_create_passes_through() {
        let stmts = split_script("CREATE TABLE x (a INT)").unwrap();
        assert!(matches!(&stmts[0], Statement::Sql { keyword, .. } if keyword == "create"));
        assert!(!stmts[0].returns_rows());
    }

    #[test]
    fn test_returns_rows() {
        let script = "WITH a AS (SELECT 1) SELECT * FROM a; INSERT INTO t VALUES (1)";
        let stmts = split_script(script).unwrap();
        assert!(stmts[0].returns_rows());
        assert!(!stmts[1].returns_rows());
    }
}
