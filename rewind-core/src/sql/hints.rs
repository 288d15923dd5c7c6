//! Leading statement hints.
//!
//! A statement may start with hint comments of the form
//! `/*@ OPTIMIZER_VERSION=7, STATEMENT_TAG='report' */` or a
//! `@{RPC_PRIORITY=LOW}` prefix. They are removed from the SQL text and turned
//! into a statement-level [`OptionLayer`]. Ordinary comments before the
//! statement are skipped.

use crate::error::ConnectionError;
use crate::options::OptionLayer;

/// SQL text with its leading hints removed.
#[derive(Debug, Clone, PartialEq)]
pub struct HintedSql {
    pub sql: String,
    pub overrides: OptionLayer,
}

pub fn extract_hints(sql: &str) -> Result<HintedSql, ConnectionError> {
    let mut overrides = OptionLayer::new();
    let mut rest = sql.trim_start();

    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.find('\n').map_or("", |end| &after[end + 1..]);
        } else if let Some(after) = rest.strip_prefix("/*@") {
            let end = after
                .find("*/")
                .ok_or_else(|| unterminated("hint comment"))?;
            apply_hints(&after[..end], &mut overrides)?;
            rest = &after[end + 2..];
        } else if let Some(after) = rest.strip_prefix("/*") {
            let end = after.find("*/").ok_or_else(|| unterminated("comment"))?;
            rest = &after[end + 2..];
        } else if let Some(after) = rest.strip_prefix("@{") {
            let end = after.find('}').ok_or_else(|| unterminated("statement hint"))?;
            apply_hints(&after[..end], &mut overrides)?;
            rest = &after[end + 1..];
        } else {
            break;
        }
        rest = rest.trim_start();
    }

    Ok(HintedSql {
        sql: rest.trim_end().to_string(),
        overrides,
    })
}

fn apply_hints(body: &str, overrides: &mut OptionLayer) -> Result<(), ConnectionError> {
    for pair in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            ConnectionError::InvalidStatement(format!("malformed hint, expected KEY=VALUE: {pair}"))
        })?;
        let value = unquote(value.trim());
        match key.trim().to_ascii_uppercase().as_str() {
            "OPTIMIZER_VERSION" => overrides.optimizer_version = Some(value),
            "OPTIMIZER_STATISTICS_PACKAGE" => overrides.optimizer_statistics_package = Some(value),
            "RPC_PRIORITY" => overrides.rpc_priority = Some(value.parse()?),
            "STATEMENT_TAG" | "REQUEST_TAG" => overrides.statement_tag = Some(value),
            "TRANSACTION_TAG" => overrides.transaction_tag = Some(value),
            other => {
                return Err(ConnectionError::InvalidStatement(format!(
                    "unknown statement hint: {other}"
                )))
            }
        }
    }
    Ok(())
}

fn unquote(value: &str) -> String {
    let quoted = value.len() >= 2
        && ((value.starts_with('\'') && value.ends_with('\''))
            || (value.starts_with('"') && value.ends_with('"')));
    if quoted {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

fn unterminated(what: &str) -> ConnectionError {
    ConnectionError::InvalidStatement(format!("unterminated {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RpcPriority;

    #[test]
    fn extracts_hint_comment_before_statement() -> anyhow::Result<()> {
        let hinted = extract_hints(
            "/*@ OPTIMIZER_VERSION=7, rpc_priority=HIGH, STATEMENT_TAG='report' */ SELECT 1",
        )?;
        assert_eq!(hinted.sql, "SELECT 1");
        assert_eq!(hinted.overrides.optimizer_version.as_deref(), Some("7"));
        assert_eq!(hinted.overrides.rpc_priority, Some(RpcPriority::High));
        assert_eq!(hinted.overrides.statement_tag.as_deref(), Some("report"));
        Ok(())
    }

    #[test]
    fn skips_plain_comments_and_reads_statement_hint_prefix() -> anyhow::Result<()> {
        let hinted = extract_hints(
            "-- nightly job\n/* owner: etl */ @{TRANSACTION_TAG=load} UPDATE t SET v = 1",
        )?;
        assert_eq!(hinted.sql, "UPDATE t SET v = 1");
        assert_eq!(hinted.overrides.transaction_tag.as_deref(), Some("load"));
        assert!(hinted.overrides.statement_tag.is_none());
        Ok(())
    }

    #[test]
    fn sql_without_hints_is_unchanged() -> anyhow::Result<()> {
        let hinted = extract_hints("  SELECT * FROM t  ")?;
        assert_eq!(hinted.sql, "SELECT * FROM t");
        assert_eq!(hinted.overrides, OptionLayer::new());
        Ok(())
    }

    #[test]
    fn malformed_hints_are_rejected() {
        assert!(matches!(
            extract_hints("/*@ FORCE_INDEX=idx */ SELECT 1"),
            Err(ConnectionError::InvalidStatement(_))
        ));
        assert!(matches!(
            extract_hints("/*@ OPTIMIZER_VERSION */ SELECT 1"),
            Err(ConnectionError::InvalidStatement(_))
        ));
        assert!(matches!(
            extract_hints("/* never closed SELECT 1"),
            Err(ConnectionError::InvalidStatement(_))
        ));
    }
}
