//! Named-placeholder statement builder over rusqlite

use civica_common::database::Error;
use rusqlite::{ffi, CachedStatement, Connection, Error as SqliteError, ErrorCode};

pub type Value = rusqlite::types::Value;

/// The Column type
pub type Column = rusqlite::types::Value;

/// Sql message
#[derive(Default, Debug)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<(String, Value)>,
}

/// Creates a new query statement
#[inline(always)]
pub fn query<T: ToString>(sql: T) -> Statement {
    Statement {
        sql: sql.to_string(),
        ..Default::default()
    }
}

/// Map driver failures into the shared database error, surfacing unique and
/// primary-key violations as `Duplicate`
pub fn to_db_error(err: SqliteError) -> Error {
    if let rusqlite::Error::SqliteFailure(
        ffi::Error {
            code,
            extended_code,
        },
        _,
    ) = err
    {
        if code == ErrorCode::ConstraintViolation
            && (extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE)
        {
            Error::Duplicate
        } else {
            Error::Database(Box::new(rusqlite::Error::SqliteFailure(
                ffi::Error {
                    code,
                    extended_code,
                },
                None,
            )))
        }
    } else {
        Error::Database(Box::new(err))
    }
}

impl Statement {
    #[inline]
    pub fn bind<C: ToString, V: Into<Value>>(mut self, name: C, value: V) -> Self {
        self.args.push((name.to_string(), value.into()));
        self
    }

    /// Binds a single variable with a vector.
    ///
    /// This will rewrite the statement from `:foo` (where value is
    /// vec![1, 2, 3]) to `:foo0, :foo1, :foo2` and binds each value from the
    /// value vector accordingly.
    #[inline]
    pub fn bind_vec<C: ToString, V: Into<Value>>(mut self, name: C, value: Vec<V>) -> Self {
        let mut new_sql = String::with_capacity(self.sql.len());
        let target = name.to_string();
        let mut i = 0;

        let placeholders = value
            .into_iter()
            .enumerate()
            .map(|(key, value)| {
                let key = format!("{target}{key}");
                self.args.push((key.clone(), value.into()));
                key
            })
            .collect::<Vec<_>>()
            .join(",");

        while let Some(pos) = self.sql[i..].find(&target) {
            let abs_pos = i + pos;
            let after = abs_pos + target.len();
            let is_word_boundary = self.sql[after..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric() && c != '_');

            if is_word_boundary {
                new_sql.push_str(&self.sql[i..abs_pos]);
                new_sql.push_str(&placeholders);
                i = after;
            } else {
                new_sql.push_str(&self.sql[i..=abs_pos]);
                i = abs_pos + 1;
            }
        }

        new_sql.push_str(&self.sql[i..]);

        self.sql = new_sql;
        self
    }

    fn get_stmt<'a>(self, conn: &'a Connection) -> Result<CachedStatement<'a>, Error> {
        let mut stmt = conn.prepare_cached(&self.sql).map_err(to_db_error)?;
        for (name, value) in self.args {
            let index = stmt
                .parameter_index(&name)
                .map_err(to_db_error)?
                .ok_or(Error::MissingPlaceholder(name))?;

            stmt.raw_bind_parameter(index, value).map_err(to_db_error)?;
        }

        Ok(stmt)
    }

    /// Executes a query and returns the affected rows
    pub fn execute(self, conn: &Connection) -> Result<usize, Error> {
        self.get_stmt(conn)?.raw_execute().map_err(to_db_error)
    }

    /// Runs the query and returns the first row or None
    pub fn fetch_one(self, conn: &Connection) -> Result<Option<Vec<Column>>, Error> {
        let mut stmt = self.get_stmt(conn)?;
        let columns = stmt.column_count();
        let mut rows = stmt.raw_query();
        rows.next()
            .map_err(to_db_error)?
            .map(|row| {
                (0..columns)
                    .map(|i| row.get(i))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
            .map_err(to_db_error)
    }

    /// Runs the query and returns every matching row
    pub fn fetch_all(self, conn: &Connection) -> Result<Vec<Vec<Column>>, Error> {
        let mut stmt = self.get_stmt(conn)?;
        let columns = stmt.column_count();
        let mut rows = stmt.raw_query();
        let mut results = vec![];

        while let Some(row) = rows.next().map_err(to_db_error)? {
            results.push(
                (0..columns)
                    .map(|i| row.get(i))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(to_db_error)?,
            );
        }

        Ok(results)
    }
}
