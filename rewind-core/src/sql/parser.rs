//! Statement classification.
//!
//! Classification looks at the leading keyword of the hint-stripped text and
//! only falls back to a full parse when the keyword alone is ambiguous
//! (`WITH ...`). Text that cannot be classified is rejected.

use sqlparser::ast::{SetExpr, Statement as AstStatement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use super::command::{parse_command, BatchControl, ClientCommand, Command};
use super::hints::extract_hints;
use crate::error::ConnectionError;
use crate::options::OptionLayer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    ClientCommand(ClientCommand),
    BatchControl(BatchControl),
    Ddl,
    Query,
    Dml,
}

impl StatementKind {
    pub fn name(&self) -> &'static str {
        match self {
            StatementKind::ClientCommand(_) => "client_command",
            StatementKind::BatchControl(_) => "batch_control",
            StatementKind::Ddl => "ddl",
            StatementKind::Query => "query",
            StatementKind::Dml => "dml",
        }
    }
}

/// A classified statement. `sql` no longer carries the leading hints, which
/// are available as `overrides`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStatement {
    kind: StatementKind,
    sql: String,
    overrides: OptionLayer,
}

impl ParsedStatement {
    pub fn parse(sql: &str) -> Result<Self, ConnectionError> {
        let hinted = extract_hints(sql)?;
        let tokens = tokenize(&hinted.sql)?;
        if tokens.is_empty() {
            return Err(ConnectionError::InvalidStatement(
                "empty statement".to_string(),
            ));
        }
        reject_multiple_statements(&tokens)?;

        let kind = match parse_command(&tokens)? {
            Some(Command::Client(command)) => StatementKind::ClientCommand(command),
            Some(Command::Batch(control)) => StatementKind::BatchControl(control),
            None => classify_backend_statement(&tokens, &hinted.sql)?,
        };

        let sql = hinted.sql.trim_end_matches(';').trim_end().to_string();
        Ok(Self {
            kind,
            sql,
            overrides: hinted.overrides,
        })
    }

    pub fn kind(&self) -> &StatementKind {
        &self.kind
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn overrides(&self) -> &OptionLayer {
        &self.overrides
    }

    pub fn is_query(&self) -> bool {
        matches!(self.kind, StatementKind::Query)
    }

    pub fn is_dml(&self) -> bool {
        matches!(self.kind, StatementKind::Dml)
    }

    pub fn is_ddl(&self) -> bool {
        matches!(self.kind, StatementKind::Ddl)
    }
}

/// Tokens of `sql` without whitespace and comments.
pub(crate) fn tokenize(sql: &str) -> Result<Vec<Token>, ConnectionError> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| ConnectionError::InvalidStatement(e.to_string()))?;
    Ok(tokens
        .into_iter()
        .filter(|token| !matches!(token, Token::Whitespace(_)))
        .collect())
}

fn reject_multiple_statements(tokens: &[Token]) -> Result<(), ConnectionError> {
    let first_semicolon = tokens.iter().position(|t| *t == Token::SemiColon);
    if let Some(index) = first_semicolon {
        if tokens[index..].iter().any(|t| *t != Token::SemiColon) {
            return Err(ConnectionError::InvalidStatement(
                "multiple statements are not supported".to_string(),
            ));
        }
    }
    Ok(())
}

fn classify_backend_statement(
    tokens: &[Token],
    sql: &str,
) -> Result<StatementKind, ConnectionError> {
    let keyword = match &tokens[0] {
        Token::LParen => return Ok(StatementKind::Query),
        Token::Word(word) => word.value.to_ascii_uppercase(),
        other => {
            return Err(ConnectionError::InvalidStatement(format!(
                "unexpected token at start of statement: {other}"
            )))
        }
    };

    match keyword.as_str() {
        "SELECT" | "EXPLAIN" | "VALUES" | "TABLE" => Ok(StatementKind::Query),
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" => Ok(StatementKind::Dml),
        "CREATE" | "ALTER" | "DROP" | "GRANT" | "REVOKE" | "RENAME" | "ANALYZE" => {
            Ok(StatementKind::Ddl)
        }
        "WITH" => classify_with_parser(sql),
        other => Err(ConnectionError::InvalidStatement(format!(
            "unknown statement type: {other}"
        ))),
    }
}

/// `WITH` may introduce a query or a DML statement; let the parser decide.
fn classify_with_parser(sql: &str) -> Result<StatementKind, ConnectionError> {
    let dialect = GenericDialect {};
    let statements = Parser::parse_sql(&dialect, sql)
        .map_err(|e| ConnectionError::InvalidStatement(e.to_string()))?;
    match statements.as_slice() {
        [AstStatement::Query(query)] => {
            if matches!(*query.body, SetExpr::Insert(_) | SetExpr::Update(_)) {
                Ok(StatementKind::Dml)
            } else {
                Ok(StatementKind::Query)
            }
        }
        [AstStatement::Insert { .. }]
        | [AstStatement::Update { .. }]
        | [AstStatement::Delete { .. }] => Ok(StatementKind::Dml),
        _ => Err(ConnectionError::InvalidStatement(
            "cannot classify WITH statement".to_string(),
        )),
    }
}
