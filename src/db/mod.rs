use chrono::prelude::*;
use diesel::backend;
use diesel::connection::SimpleConnection;
use diesel::deserialize::{self, FromSql};
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Timestamp;
use diesel::sqlite::Sqlite;
use diesel::{prelude::*, AsExpression, FromSqlRow};
use serde::{Serialize, Serializer};
use tokio::task;

use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::StorageError;

pub mod schema;
use schema::measurements;

const CREATE_MEASUREMENTS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS measurements (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        temperature REAL NOT NULL,
        humidity REAL NOT NULL DEFAULT 0,
        timestamp DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    )";

/// A stored reading, serialized as-is in query responses.
#[derive(Debug, Clone, PartialEq, Queryable, Serialize)]
pub struct Measurement {
    pub id: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: UtcTimestamp,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = schema::measurements)]
struct NewMeasurement {
    temperature: f64,
    humidity: f64,
    timestamp: UtcTimestamp,
}

/// Which rows a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// The `n` most recent rows.
    Latest(i64),
    /// Every row stored at or after the given instant.
    Since(UtcTimestamp),
}

/// UTC instant with whole-second precision, stored the way SQLite's
/// `CURRENT_TIMESTAMP` writes it (`YYYY-MM-DD HH:MM:SS`), so text comparison
/// in SQL matches chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, AsExpression, FromSqlRow)]
#[diesel(sql_type = Timestamp)]
pub struct UtcTimestamp(DateTime<Utc>);

impl UtcTimestamp {
    const FORMAT: &'static str = "%Y-%m-%d %H:%M:%S";

    pub fn now() -> UtcTimestamp {
        UtcTimestamp::from(Utc::now())
    }
}

impl From<DateTime<Utc>> for UtcTimestamp {
    fn from(instant: DateTime<Utc>) -> Self {
        UtcTimestamp(instant.trunc_subsecs(0))
    }
}

impl Deref for UtcTimestamp {
    type Target = DateTime<Utc>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(Self::FORMAT))
    }
}

impl Serialize for UtcTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromSql<Timestamp, Sqlite> for UtcTimestamp
where
    NaiveDateTime: FromSql<Timestamp, Sqlite>,
{
    fn from_sql(value: backend::RawValue<'_, Sqlite>) -> deserialize::Result<Self> {
        let naive = <NaiveDateTime as FromSql<Timestamp, Sqlite>>::from_sql(value)?;

        Ok(UtcTimestamp(naive.and_utc()))
    }
}

impl ToSql<Timestamp, Sqlite> for UtcTimestamp {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.to_string());

        Ok(IsNull::No)
    }
}

/// Handle to the measurement database.
///
/// Cloning is cheap; all clones share the one connection opened at startup.
/// The connection sits behind a mutex, so writes are serialized in the order
/// they reach it, and every statement runs on the blocking thread pool.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl Store {
    /// Opens (creating if needed) the database file and its parent directory.
    pub fn open(path: &Path) -> Result<Store, StorageError> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StorageError::CreateDir {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let url = path.to_string_lossy();
        let conn = SqliteConnection::establish(&url).map_err(|source| StorageError::Connect {
            path: url.to_string(),
            source,
        })?;

        log::info!("Opened measurement database at {}", path.display());
        Ok(Store::from_connection(conn))
    }

    fn from_connection(conn: SqliteConnection) -> Store {
        Store {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Creates the measurements table unless it already exists.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        self.run(|conn| conn.batch_execute(CREATE_MEASUREMENTS_TABLE))
            .await?;

        log::info!("Measurement table ready.");
        Ok(())
    }

    /// Appends a reading stamped with the current time. Missing humidity is stored as 0.
    pub async fn insert(&self, temperature: f64, humidity: Option<f64>) -> Result<(), StorageError> {
        self.insert_with(temperature, humidity, UtcTimestamp::now)
            .await
    }

    pub(crate) async fn insert_at(
        &self,
        temperature: f64,
        humidity: Option<f64>,
        timestamp: UtcTimestamp,
    ) -> Result<(), StorageError> {
        self.insert_with(temperature, humidity, move || timestamp)
            .await
    }

    /// `stamp` runs while the connection is held, so later ids never get earlier timestamps.
    async fn insert_with<F>(
        &self,
        temperature: f64,
        humidity: Option<f64>,
        stamp: F,
    ) -> Result<(), StorageError>
    where
        F: FnOnce() -> UtcTimestamp + Send + 'static,
    {
        self.run(move |conn| {
            let insertable = NewMeasurement {
                temperature,
                humidity: humidity.unwrap_or(0.0),
                timestamp: stamp(),
            };

            log::trace!("Inserting measurement into DB: {insertable:?}");
            diesel::insert_into(measurements::table)
                .values(&insertable)
                .execute(conn)
        })
        .await?;

        Ok(())
    }

    /// Reads rows matching `filter`, always in ascending `(timestamp, id)` order.
    pub async fn query(&self, filter: Filter) -> Result<Vec<Measurement>, StorageError> {
        self.run(move |conn| match filter {
            Filter::Latest(limit) => {
                let mut rows = measurements::table
                    .order((measurements::timestamp.desc(), measurements::id.desc()))
                    .limit(limit)
                    .load::<Measurement>(conn)?;

                rows.sort_by_key(|row| (row.timestamp, row.id));
                Ok(rows)
            }
            Filter::Since(since) => measurements::table
                .filter(measurements::timestamp.ge(since))
                .order((measurements::timestamp.asc(), measurements::id.asc()))
                .load::<Measurement>(conn),
        })
        .await
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> QueryResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);

        task::spawn_blocking(move || {
            let mut locked_conn = conn.lock().map_err(|_| StorageError::Poisoned)?;
            op(&mut *locked_conn).map_err(StorageError::from)
        })
        .await?
    }
}

#[cfg(test)]
impl Store {
    pub(crate) fn in_memory() -> Store {
        let conn = SqliteConnection::establish(":memory:").expect("in-memory sqlite");
        Store::from_connection(conn)
    }

    pub(crate) async fn count(&self) -> i64 {
        self.run(|conn| measurements::table.count().get_result::<i64>(conn))
            .await
            .expect("count rows")
    }
}
