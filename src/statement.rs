//! Statement templates and argument binding.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};

use crate::connection::Connection;
use crate::driver::BoundStatement;
use crate::error::SqlSessionError;
use crate::executor::ExecutableStatement;
use crate::options::StatementOptions;
use crate::placeholders::{ParsedSql, parse_named};
use crate::types::SqlParam;

/// A SQL template with `:name` parameters, bound to one connection.
///
/// Creating and binding a statement performs no I/O; every binding error is reported before
/// anything reaches the driver. One statement can be bound any number of times.
#[derive(Debug, Clone)]
pub struct Statement {
    conn: Connection,
    parsed: Arc<ParsedSql>,
    options: StatementOptions,
}

impl Statement {
    pub(crate) fn new(conn: Connection, sql: &str, options: StatementOptions) -> Self {
        Self {
            conn,
            parsed: Arc::new(parse_named(sql)),
            options,
        }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.parsed.original
    }

    /// Declared parameter names in order of first appearance.
    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.parsed.params
    }

    #[must_use]
    pub fn options(&self) -> &StatementOptions {
        &self.options
    }

    /// Bind arguments by parameter name.
    ///
    /// A name given twice keeps its last value.
    ///
    /// # Errors
    /// In order of precedence: [`SqlSessionError::NoSuchParam`] for a name the template does not
    /// declare, [`SqlSessionError::MissingParamVal`] for a declared parameter without a value, and
    /// [`SqlSessionError::NoSuitableConverter`] for a value the driver cannot send.
    pub fn bind<I, K, V>(&self, args: I) -> Result<ExecutableStatement, SqlSessionError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<SqlParam>,
    {
        let mut slots: Vec<Option<SqlParam>> = vec![None; self.parsed.params.len()];
        for (name, value) in args {
            let name = name.as_ref();
            let pos = self
                .parsed
                .position_of(name)
                .ok_or_else(|| SqlSessionError::NoSuchParam(name.to_string()))?;
            slots[pos] = Some(value.into());
        }
        let params = slots
            .into_iter()
            .zip(&self.parsed.params)
            .map(|(slot, name)| {
                slot.ok_or_else(|| SqlSessionError::MissingParamVal(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.finish(params)
    }

    /// Bind arguments by position; the first value binds the first declared parameter.
    ///
    /// # Errors
    /// [`SqlSessionError::MissingParamVal`] when too few values are given,
    /// [`SqlSessionError::TooManyParams`] when too many are, and
    /// [`SqlSessionError::NoSuitableConverter`] for a value the driver cannot send.
    pub fn bind_by_idx<I, V>(&self, args: I) -> Result<ExecutableStatement, SqlSessionError>
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlParam>,
    {
        let params: Vec<SqlParam> = args.into_iter().map(Into::into).collect();
        let declared = self.parsed.params.len();
        if params.len() < declared {
            return Err(SqlSessionError::MissingParamVal(
                self.parsed.params[params.len()].clone(),
            ));
        }
        if params.len() > declared {
            return Err(SqlSessionError::TooManyParams {
                declared,
                provided: params.len(),
            });
        }
        self.finish(params)
    }

    /// Bind with no arguments.
    ///
    /// # Errors
    /// [`SqlSessionError::MissingParamVal`] if the template declares any parameter.
    pub fn no_args(&self) -> Result<ExecutableStatement, SqlSessionError> {
        self.bind_by_idx(std::iter::empty::<SqlParam>())
    }

    /// Start an incremental named binding.
    ///
    /// ```rust,no_run
    /// # fn demo(conn: &sql_session::Connection) -> Result<(), sql_session::SqlSessionError> {
    /// let exec = conn
    ///     .statement("select * from users where name = :name and age > :age")?
    ///     .arg("name", "ada")
    ///     .arg("age", 30)
    ///     .bind()?;
    /// # let _ = exec;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn arg(&self, name: impl Into<String>, value: impl Into<SqlParam>) -> StatementArgBinder {
        StatementArgBinder {
            statement: self.clone(),
            args: vec![(name.into(), value.into())],
        }
    }

    /// Execute once per named argument set, in arrival order, pulling the next set only after the
    /// previous execution finished. Resolves to the summed rows-affected count.
    ///
    /// # Errors
    /// The first binding or execution error; later sets are not pulled.
    pub async fn stream_args<S, I, K, V>(&self, args: S) -> Result<u64, SqlSessionError>
    where
        S: Stream<Item = I>,
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<SqlParam>,
    {
        let mut args = std::pin::pin!(args);
        let mut total = 0_u64;
        while let Some(set) = args.next().await {
            total += self.bind(set)?.execute_for_rows_affected().await?;
        }
        Ok(total)
    }

    /// Positional form of [`Statement::stream_args`].
    ///
    /// # Errors
    /// The first binding or execution error; later sets are not pulled.
    pub async fn stream_args_by_idx<S, I, V>(&self, args: S) -> Result<u64, SqlSessionError>
    where
        S: Stream<Item = I>,
        I: IntoIterator<Item = V>,
        V: Into<SqlParam>,
    {
        let mut args = std::pin::pin!(args);
        let mut total = 0_u64;
        while let Some(set) = args.next().await {
            total += self.bind_by_idx(set)?.execute_for_rows_affected().await?;
        }
        Ok(total)
    }

    fn finish(&self, params: Vec<SqlParam>) -> Result<ExecutableStatement, SqlSessionError> {
        let checker = self.conn.param_checker();
        for (name, param) in self.parsed.params.iter().zip(&params) {
            checker.check(name, param)?;
        }
        let bound = BoundStatement {
            sql: self.parsed.native.clone(),
            params,
            options: self.options.clone(),
        };
        Ok(ExecutableStatement::new(self.conn.clone(), Arc::new(bound)))
    }
}

/// Append-only named argument builder, finished by [`StatementArgBinder::bind`].
#[derive(Debug, Clone)]
#[must_use]
pub struct StatementArgBinder {
    statement: Statement,
    args: Vec<(String, SqlParam)>,
}

impl StatementArgBinder {
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<SqlParam>) -> Self {
        self.args.push((name.into(), value.into()));
        self
    }

    /// # Errors
    /// As [`Statement::bind`].
    pub fn bind(self) -> Result<ExecutableStatement, SqlSessionError> {
        self.statement.bind(self.args)
    }
}
