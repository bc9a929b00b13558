use crate::error::{Error, Result};

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::path::PathBuf;

embed_migrations!("migrations");

/// Where the SQLite file lives and how connections to it are set up. Each
/// request opens its own connection and drops it when it is done.
#[derive(Clone, Debug)]
pub struct Database {
    path: PathBuf,
    busy_timeout_ms: u32,
}

impl Database {
    pub fn new(path: PathBuf, busy_timeout_ms: u32) -> Database {
        Database {
            path,
            busy_timeout_ms,
        }
    }

    pub fn connect(&self) -> Result<SqliteConnection> {
        let conn = SqliteConnection::establish(&format!("{}", self.path.display()))
            .map_err(Error::DatabaseConnection)?;
        configure(&conn, self.busy_timeout_ms)?;
        Ok(conn)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.connect()?;
        embedded_migrations::run(&conn).map_err(Error::Migration)
    }
}

fn configure(conn: &SqliteConnection, busy_timeout_ms: u32) -> Result<()> {
    conn.execute("PRAGMA foreign_keys = ON")?;
    conn.execute(&format!("PRAGMA busy_timeout = {}", busy_timeout_ms))?;
    Ok(())
}

no_arg_sql_function!(
    last_insert_rowid,
    diesel::sql_types::Integer,
    "Represents the SQL last_insert_row() function"
);

/// Id of the row most recently inserted on this connection.
pub fn last_insert_id(conn: &SqliteConnection) -> Result<i32> {
    Ok(diesel::select(last_insert_rowid).get_result::<i32>(conn)?)
}

#[cfg(test)]
pub fn test_connection() -> SqliteConnection {
    let conn = SqliteConnection::establish(":memory:").unwrap();
    configure(&conn, 1000).unwrap();
    embedded_migrations::run(&conn).unwrap();
    conn
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::schema::churches::dsl::churches;
    use diesel::prelude::*;

    #[test]
    fn migrates_a_fresh_file_and_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::new(dir.path().join("events.sqlite"), 1000);
        database.migrate().unwrap();
        database.migrate().unwrap();

        let conn = database.connect().unwrap();
        let count: i64 = churches.count().get_result(&conn).unwrap();
        assert_eq!(count, 0);
    }
}
