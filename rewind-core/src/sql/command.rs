//! Statements handled by the connection itself instead of the backend.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use sqlparser::tokenizer::Token;

use crate::error::ConnectionError;
use crate::options::IsolationLevel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `BEGIN` / `START TRANSACTION`, optionally with an isolation level.
    Begin {
        isolation_level: Option<IsolationLevel>,
    },
    Commit,
    Rollback,
    Savepoint(String),
    RollbackToSavepoint(String),
    ReleaseSavepoint(String),
    Set { variable: Variable, value: String },
    Show(Variable),
    /// `SET TRANSACTION ISOLATION LEVEL ...` for the current or next transaction.
    SetTransactionIsolation(IsolationLevel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchControl {
    StartDdl,
    StartDml,
    Run,
    Abort,
}

/// Connection variables readable with `SHOW` and (mostly) writable with `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    Autocommit,
    ReadOnly,
    RetryAbortsInternally,
    StatementTag,
    TransactionTag,
    OptimizerVersion,
    OptimizerStatisticsPackage,
    RpcPriority,
    MaxCommitDelay,
    ReturnCommitStats,
    StatementTimeout,
    IsolationLevel,
    CommitTimestamp,
    CommitResponse,
    RetryCount,
}

impl Variable {
    pub fn name(&self) -> &'static str {
        match self {
            Variable::Autocommit => "AUTOCOMMIT",
            Variable::ReadOnly => "READONLY",
            Variable::RetryAbortsInternally => "RETRY_ABORTS_INTERNALLY",
            Variable::StatementTag => "STATEMENT_TAG",
            Variable::TransactionTag => "TRANSACTION_TAG",
            Variable::OptimizerVersion => "OPTIMIZER_VERSION",
            Variable::OptimizerStatisticsPackage => "OPTIMIZER_STATISTICS_PACKAGE",
            Variable::RpcPriority => "RPC_PRIORITY",
            Variable::MaxCommitDelay => "MAX_COMMIT_DELAY",
            Variable::ReturnCommitStats => "RETURN_COMMIT_STATS",
            Variable::StatementTimeout => "STATEMENT_TIMEOUT",
            Variable::IsolationLevel => "ISOLATION_LEVEL",
            Variable::CommitTimestamp => "COMMIT_TIMESTAMP",
            Variable::CommitResponse => "COMMIT_RESPONSE",
            Variable::RetryCount => "RETRY_COUNT",
        }
    }

    /// Variables that report state and cannot be assigned.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Variable::CommitTimestamp | Variable::CommitResponse | Variable::RetryCount
        )
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variable {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let variable = match s.to_ascii_uppercase().as_str() {
            "AUTOCOMMIT" => Variable::Autocommit,
            "READONLY" | "READ_ONLY" => Variable::ReadOnly,
            "RETRY_ABORTS_INTERNALLY" => Variable::RetryAbortsInternally,
            "STATEMENT_TAG" => Variable::StatementTag,
            "TRANSACTION_TAG" => Variable::TransactionTag,
            "OPTIMIZER_VERSION" => Variable::OptimizerVersion,
            "OPTIMIZER_STATISTICS_PACKAGE" => Variable::OptimizerStatisticsPackage,
            "RPC_PRIORITY" => Variable::RpcPriority,
            "MAX_COMMIT_DELAY" => Variable::MaxCommitDelay,
            "RETURN_COMMIT_STATS" => Variable::ReturnCommitStats,
            "STATEMENT_TIMEOUT" => Variable::StatementTimeout,
            "ISOLATION_LEVEL" => Variable::IsolationLevel,
            "COMMIT_TIMESTAMP" => Variable::CommitTimestamp,
            "COMMIT_RESPONSE" => Variable::CommitResponse,
            "RETRY_COUNT" => Variable::RetryCount,
            _ => {
                return Err(ConnectionError::InvalidArgument(format!(
                    "unknown variable: {s}"
                )))
            }
        };
        Ok(variable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Client(ClientCommand),
    Batch(BatchControl),
}

/// Parses a client-side statement. Returns `Ok(None)` when the leading keyword
/// does not introduce one.
pub(crate) fn parse_command(tokens: &[Token]) -> Result<Option<Command>, ConnectionError> {
    let mut cursor = Cursor::new(tokens);
    let Some(first) = cursor.peek_keyword() else {
        return Ok(None);
    };

    let command = match first.as_str() {
        "BEGIN" => {
            cursor.advance();
            cursor.eat_any(&["TRANSACTION", "WORK"]);
            Command::Client(ClientCommand::Begin {
                isolation_level: cursor.isolation_clause()?,
            })
        }
        "START" => {
            cursor.advance();
            if cursor.eat("BATCH") {
                match cursor.keyword()?.as_str() {
                    "DDL" => Command::Batch(BatchControl::StartDdl),
                    "DML" => Command::Batch(BatchControl::StartDml),
                    other => return Err(invalid(format!("unknown batch type: {other}"))),
                }
            } else if cursor.eat("TRANSACTION") {
                Command::Client(ClientCommand::Begin {
                    isolation_level: cursor.isolation_clause()?,
                })
            } else {
                return Err(invalid("expected TRANSACTION or BATCH after START"));
            }
        }
        "COMMIT" => {
            cursor.advance();
            cursor.eat_any(&["TRANSACTION", "WORK"]);
            Command::Client(ClientCommand::Commit)
        }
        "ROLLBACK" => {
            cursor.advance();
            cursor.eat_any(&["TRANSACTION", "WORK"]);
            if cursor.eat("TO") {
                cursor.eat("SAVEPOINT");
                Command::Client(ClientCommand::RollbackToSavepoint(cursor.identifier()?))
            } else {
                Command::Client(ClientCommand::Rollback)
            }
        }
        "SAVEPOINT" => {
            cursor.advance();
            Command::Client(ClientCommand::Savepoint(cursor.identifier()?))
        }
        "RELEASE" => {
            cursor.advance();
            cursor.eat("SAVEPOINT");
            Command::Client(ClientCommand::ReleaseSavepoint(cursor.identifier()?))
        }
        "SET" => {
            cursor.advance();
            if cursor.eat("TRANSACTION") {
                cursor.expect("ISOLATION")?;
                cursor.expect("LEVEL")?;
                Command::Client(ClientCommand::SetTransactionIsolation(
                    cursor.isolation_level()?,
                ))
            } else {
                let variable: Variable = cursor.identifier()?.parse()?;
                if variable.is_read_only() {
                    return Err(ConnectionError::InvalidArgument(format!(
                        "variable {variable} is read-only"
                    )));
                }
                if !cursor.eat_token(&Token::Eq) && !cursor.eat("TO") {
                    return Err(invalid(format!("expected = or TO after SET {variable}")));
                }
                Command::Client(ClientCommand::Set {
                    variable,
                    value: cursor.remaining_value()?,
                })
            }
        }
        "SHOW" => {
            cursor.advance();
            cursor.eat("VARIABLE");
            Command::Client(ClientCommand::Show(cursor.identifier()?.parse()?))
        }
        "RUN" => {
            cursor.advance();
            cursor.expect("BATCH")?;
            Command::Batch(BatchControl::Run)
        }
        "ABORT" => {
            cursor.advance();
            cursor.expect("BATCH")?;
            Command::Batch(BatchControl::Abort)
        }
        _ => return Ok(None),
    };

    cursor.finish()?;
    Ok(Some(command))
}

pub(crate) fn parse_bool(value: &str) -> Result<bool, ConnectionError> {
    match value.trim().to_ascii_uppercase().as_str() {
        "TRUE" | "ON" => Ok(true),
        "FALSE" | "OFF" => Ok(false),
        _ => Err(ConnectionError::InvalidArgument(format!(
            "expected a boolean, got {value}"
        ))),
    }
}

/// Parses `100ms`, `2s`, `1m`, `250us`, `10ns` or a bare number of
/// milliseconds. `NULL` and zero clear the value.
pub(crate) fn parse_duration(value: &str) -> Result<Option<Duration>, ConnectionError> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("NULL") || value.is_empty() {
        return Ok(None);
    }
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| ConnectionError::InvalidArgument(format!("invalid duration: {value}")))?;
    let duration = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "us" => Duration::from_micros(amount),
        "ns" => Duration::from_nanos(amount),
        other => {
            return Err(ConnectionError::InvalidArgument(format!(
                "unknown duration unit: {other}"
            )))
        }
    };
    Ok((!duration.is_zero()).then_some(duration))
}

pub(crate) fn format_duration(value: Option<Duration>) -> String {
    match value {
        None => "NULL".to_string(),
        Some(d) if d.subsec_nanos() % 1_000_000 == 0 => format!("{}ms", d.as_millis()),
        Some(d) => format!("{}ns", d.as_nanos()),
    }
}

fn invalid(message: impl Into<String>) -> ConnectionError {
    ConnectionError::InvalidStatement(message.into())
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn peek_keyword(&self) -> Option<String> {
        match self.peek() {
            Some(Token::Word(word)) if word.quote_style.is_none() => {
                Some(word.value.to_ascii_uppercase())
            }
            _ => None,
        }
    }

    fn eat(&mut self, keyword: &str) -> bool {
        if self.peek_keyword().as_deref() == Some(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_any(&mut self, keywords: &[&str]) -> bool {
        keywords.iter().any(|keyword| self.eat(keyword))
    }

    fn eat_token(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, keyword: &str) -> Result<(), ConnectionError> {
        if self.eat(keyword) {
            Ok(())
        } else {
            Err(invalid(format!("expected {keyword}")))
        }
    }

    fn keyword(&mut self) -> Result<String, ConnectionError> {
        let keyword = self.peek_keyword().ok_or_else(|| invalid("expected a keyword"))?;
        self.advance();
        Ok(keyword)
    }

    fn identifier(&mut self) -> Result<String, ConnectionError> {
        let name = match self.peek() {
            Some(Token::Word(word)) => word.value.clone(),
            Some(Token::SingleQuotedString(s)) | Some(Token::DoubleQuotedString(s)) => s.clone(),
            Some(Token::Number(n, _)) => n.clone(),
            _ => return Err(invalid("expected a name")),
        };
        self.advance();
        Ok(name)
    }

    fn isolation_clause(&mut self) -> Result<Option<IsolationLevel>, ConnectionError> {
        if self.eat("ISOLATION") {
            self.expect("LEVEL")?;
            Ok(Some(self.isolation_level()?))
        } else {
            Ok(None)
        }
    }

    fn isolation_level(&mut self) -> Result<IsolationLevel, ConnectionError> {
        if self.eat("SERIALIZABLE") {
            Ok(IsolationLevel::Serializable)
        } else if self.eat("REPEATABLE") {
            self.expect("READ")?;
            Ok(IsolationLevel::RepeatableRead)
        } else {
            Err(invalid("expected SERIALIZABLE or REPEATABLE READ"))
        }
    }

    /// Everything up to an optional trailing semicolon, rendered as a value.
    fn remaining_value(&mut self) -> Result<String, ConnectionError> {
        let mut value = String::new();
        let mut previous_was_word = false;
        while let Some(token) = self.peek() {
            if *token == Token::SemiColon {
                break;
            }
            let is_word = matches!(token, Token::Word(_));
            if is_word && previous_was_word {
                value.push(' ');
            }
            match token {
                Token::Word(word) => value.push_str(&word.value),
                Token::SingleQuotedString(s) | Token::DoubleQuotedString(s) => value.push_str(s),
                Token::Number(n, _) => value.push_str(n),
                other => value.push_str(&other.to_string()),
            }
            previous_was_word = is_word;
            self.advance();
        }
        if value.is_empty() {
            return Err(invalid("expected a value"));
        }
        Ok(value)
    }

    fn finish(&mut self) -> Result<(), ConnectionError> {
        while self.eat_token(&Token::SemiColon) {}
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(invalid(format!("unexpected token: {token}"))),
        }
    }
}
