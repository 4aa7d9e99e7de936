use std::sync::LazyLock;

use regex::Regex;
use rusqlite::ErrorCode;

use crate::error::SqlSessionError;

static CONSTRAINT_MESSAGE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(UNIQUE|NOT NULL|CHECK|FOREIGN KEY|PRIMARY KEY) constraint failed(?:: (.*))?$")
        .ok()
});

/// Map a rusqlite error to the failure kind callers match on.
pub(crate) fn map_sqlite_error(err: rusqlite::Error) -> SqlSessionError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
            ErrorCode::ConstraintViolation => {
                constraint_violation(message.as_deref().unwrap_or_default(), &err)
            }
            ErrorCode::AuthorizationForStatementDenied | ErrorCode::PermissionDenied => {
                SqlSessionError::Unauthorized(err.to_string())
            }
            // SQLITE_ERROR: syntax errors, unknown tables and columns, and the like.
            ErrorCode::Unknown => SqlSessionError::InvalidQuery(err.to_string()),
            ErrorCode::OperationInterrupted => {
                SqlSessionError::ExecutionError(format!("interrupted: {err}"))
            }
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => {
                SqlSessionError::ConnectionError(err.to_string())
            }
            _ => SqlSessionError::ExecutionError(err.to_string()),
        },
        rusqlite::Error::MultipleStatement
        | rusqlite::Error::InvalidParameterName(_)
        | rusqlite::Error::InvalidParameterCount(_, _)
        | rusqlite::Error::InvalidColumnName(_) => SqlSessionError::InvalidQuery(err.to_string()),
        _ => SqlSessionError::ExecutionError(err.to_string()),
    }
}

fn constraint_violation(message: &str, err: &rusqlite::Error) -> SqlSessionError {
    let captures = CONSTRAINT_MESSAGE
        .as_ref()
        .and_then(|re| re.captures(message));
    let (kind, detail) = match &captures {
        Some(caps) => (
            caps.get(1).map_or("", |m| m.as_str()),
            caps.get(2).map_or("", |m| m.as_str()),
        ),
        None => ("", ""),
    };

    // UNIQUE / NOT NULL / PRIMARY KEY report `table.column[, table.column]`; CHECK reports the
    // constraint name or expression; FOREIGN KEY reports nothing.
    let (table, constraint) = match kind {
        "CHECK" => (String::new(), detail.to_string()),
        "" => (String::new(), String::new()),
        _ => {
            let table = detail
                .split(", ")
                .next()
                .and_then(|col| col.split_once('.'))
                .map(|(table, _)| table.to_string())
                .unwrap_or_default();
            (table, kind.to_string())
        }
    };

    SqlSessionError::ConstraintViolation {
        schema: "main".into(),
        table,
        constraint,
        message: err.to_string(),
    }
}
