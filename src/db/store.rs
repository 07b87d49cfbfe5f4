//! SQLite database store implementation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::identity;
use super::models::*;
use super::sorties;
use super::urls::{normalize_server_url, normalize_stats_page_url};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Engine tag used when a server does not name one.
pub const DEFAULT_ENGINE: &str = "il2stats";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] refinery::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// A stats page together with the pilot and server it belongs to.
#[derive(Debug, Clone)]
pub struct PageTarget {
    pub page: PilotStatsPage,
    pub pilot: Pilot,
    pub server: StatsServer,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner().run(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Run `f` inside a transaction. The transaction commits when `f` returns
    /// `Ok` and rolls back otherwise.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // --- Servers ---

    /// Add a server; the URL is reduced to its base before it is written.
    pub fn add_server(&self, name: &str, url: &str, engine: Option<&str>) -> Result<StatsServer, DbError> {
        let url = normalize_server_url(url)?;
        let engine = engine.unwrap_or(DEFAULT_ENGINE);

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO stats_servers (name, url, engine) VALUES (?1, ?2, ?3)",
            params![name, url, engine],
        )?;
        Ok(StatsServer {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            url,
            engine: engine.to_string(),
        })
    }

    /// Update a server's URL and engine.
    pub fn update_server(&self, server: &StatsServer) -> Result<StatsServer, DbError> {
        let url = normalize_server_url(&server.url)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE stats_servers SET name=?1, url=?2, engine=?3 WHERE id=?4",
            params![server.name, url, server.engine, server.id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(StatsServer { url, ..server.clone() })
    }

    pub fn get_servers(&self) -> Result<Vec<StatsServer>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, url, engine FROM stats_servers ORDER BY name")?;
        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(servers)
    }

    pub fn get_server_by_name(&self, name: &str) -> Result<Option<StatsServer>, DbError> {
        let conn = self.conn()?;
        let server = conn
            .query_row(
                "SELECT id, name, url, engine FROM stats_servers WHERE name = ?1",
                params![name],
                server_from_row,
            )
            .optional()?;
        Ok(server)
    }

    /// Delete a server and everything scraped from it.
    pub fn delete_server(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM stats_servers WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Squad pilots ---

    pub fn add_pilot(&self, username: &str) -> Result<Pilot, DbError> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO pilots (username) VALUES (?1)", params![username])?;
        Ok(Pilot {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
        })
    }

    pub fn get_pilot_by_username(&self, username: &str) -> Result<Option<Pilot>, DbError> {
        let conn = self.conn()?;
        Ok(find_pilot_by_username(&conn, username)?)
    }

    // --- Stats pages ---

    /// Add or replace the stats page of a pilot on a server.
    pub fn set_stats_page(&self, pilot_id: i64, server_id: i64, url: &str) -> Result<PilotStatsPage, DbError> {
        let url = normalize_stats_page_url(url)?;
        let conn = self.conn()?;
        let id = conn.query_row(
            "INSERT INTO pilot_stats_pages (pilot_id, server_id, url) VALUES (?1, ?2, ?3)
             ON CONFLICT(pilot_id, server_id) DO UPDATE SET url=excluded.url
             RETURNING id",
            params![pilot_id, server_id, url],
            |row| row.get(0),
        )?;
        Ok(PilotStatsPage {
            id,
            pilot_id,
            server_id,
            url,
        })
    }

    /// Stats pages to import, optionally limited to one pilot and/or one server.
    pub fn get_page_targets(
        &self,
        pilot_id: Option<i64>,
        server_id: Option<i64>,
    ) -> Result<Vec<PageTarget>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.id, p.pilot_id, p.server_id, p.url, u.username, s.name, s.url, s.engine
             FROM pilot_stats_pages p
             JOIN pilots u ON u.id = p.pilot_id
             JOIN stats_servers s ON s.id = p.server_id
             WHERE (?1 IS NULL OR p.pilot_id = ?1) AND (?2 IS NULL OR p.server_id = ?2)
             ORDER BY u.username, s.name",
        )?;
        let targets = stmt
            .query_map(params![pilot_id, server_id], |row| {
                let page = PilotStatsPage {
                    id: row.get(0)?,
                    pilot_id: row.get(1)?,
                    server_id: row.get(2)?,
                    url: row.get(3)?,
                };
                Ok(PageTarget {
                    pilot: Pilot {
                        id: page.pilot_id,
                        username: row.get(4)?,
                    },
                    server: StatsServer {
                        id: page.server_id,
                        name: row.get(5)?,
                        url: row.get(6)?,
                        engine: row.get(7)?,
                    },
                    page,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    // --- Lives and sorties ---

    #[cfg(test)]
    pub fn get_sortie(&self, sortie_id: i64) -> Result<Option<Sortie>, DbError> {
        let conn = self.conn()?;
        Ok(sorties::find_sortie(&conn, sortie_id)?)
    }

    pub fn get_pilot_sorties(&self, pilot_id: i64) -> Result<Vec<Sortie>, DbError> {
        let conn = self.conn()?;
        Ok(sorties::pilot_sorties(&conn, pilot_id)?)
    }

    pub fn get_lives(&self, pilot_id: i64) -> Result<Vec<VirtualLife>, DbError> {
        let conn = self.conn()?;
        Ok(sorties::pilot_lives(&conn, pilot_id)?)
    }

    pub fn get_open_life(&self, pilot_id: i64) -> Result<Option<VirtualLife>, DbError> {
        let conn = self.conn()?;
        Ok(sorties::open_life(&conn, pilot_id)?)
    }

    /// Start a new open life for a pilot whose previous life has ended.
    #[cfg(test)]
    pub fn open_life(&self, pilot_id: i64, start_date: NaiveDate) -> Result<VirtualLife, DbError> {
        self.transaction(|conn| Ok(sorties::create_life(conn, pilot_id, start_date)?))
    }

    pub fn get_aircraft(&self) -> Result<Vec<Aircraft>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name FROM aircraft ORDER BY name")?;
        let aircraft = stmt
            .query_map([], |row| {
                Ok(Aircraft {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(aircraft)
    }

    // --- Observed players ---

    pub fn get_some_pilot(&self, site_id: i64) -> Result<Option<SomePilot>, DbError> {
        let conn = self.conn()?;
        Ok(identity::find_some_pilot(&conn, site_id)?)
    }

    pub fn get_names(&self, some_pilot_id: i64) -> Result<Vec<SomePilotName>, DbError> {
        let conn = self.conn()?;
        Ok(identity::names(&conn, some_pilot_id)?)
    }

    pub fn current_name(&self, some_pilot_id: i64) -> Result<Option<SomePilotName>, DbError> {
        let conn = self.conn()?;
        Ok(identity::current_name(&conn, some_pilot_id)?)
    }

    pub fn count_occurrences(&self, server_id: i64) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM player_occurrences WHERE server_id = ?1",
            params![server_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Most recent sample at or before `at` for each pilot seen on a server,
    /// newest first. The coalition filter applies to the chosen samples.
    pub fn latest_samples(
        &self,
        server_id: i64,
        coalition: Option<Coalition>,
        at: DateTime<Utc>,
    ) -> Result<Vec<PlayerOccurrence>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT o.id, o.server_id, o.some_pilot_id, o.coalition, o.timestamp
             FROM player_occurrences o
             WHERE o.server_id = ?1 AND o.timestamp <= ?2
               AND o.id = (
                   SELECT o2.id FROM player_occurrences o2
                   WHERE o2.server_id = o.server_id
                     AND o2.some_pilot_id = o.some_pilot_id
                     AND o2.timestamp <= ?2
                   ORDER BY o2.timestamp DESC, o2.id DESC
                   LIMIT 1
               )
               AND (?3 IS NULL OR o.coalition = ?3)
             ORDER BY o.timestamp DESC, o.id DESC",
        )?;
        let samples = stmt
            .query_map(
                params![server_id, format_db_time(at), coalition.map(|c| c.as_str())],
                identity::occurrence_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Number of players per coalition on a server at `at`.
    ///
    /// Each pilot counts once, in the coalition of their latest sample at or
    /// before `at`. Pilots without such a sample do not count.
    pub fn roster_size_at(&self, server_id: i64, at: DateTime<Utc>) -> Result<RosterSize, DbError> {
        let mut size = RosterSize::default();
        for sample in self.latest_samples(server_id, None, at)? {
            match sample.coalition {
                Coalition::Red => size.red += 1,
                Coalition::Blue => size.blue += 1,
            }
        }
        Ok(size)
    }

    /// Timestamp of the sample nearest to `at`; the earlier one wins a tie.
    pub fn closest_sample_time(&self, server_id: i64, at: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let at_str = format_db_time(at);
        let before: Option<String> = conn.query_row(
            "SELECT MAX(timestamp) FROM player_occurrences WHERE server_id = ?1 AND timestamp <= ?2",
            params![server_id, at_str],
            |r| r.get(0),
        )?;
        let after: Option<String> = conn.query_row(
            "SELECT MIN(timestamp) FROM player_occurrences WHERE server_id = ?1 AND timestamp > ?2",
            params![server_id, at_str],
            |r| r.get(0),
        )?;

        let before = before.and_then(|s| parse_db_time(&s));
        let after = after.and_then(|s| parse_db_time(&s));
        Ok(match (before, after) {
            (Some(b), Some(a)) => {
                if at - b <= a - at {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (b, a) => b.or(a),
        })
    }
}

pub(crate) fn find_pilot_by_username(conn: &Connection, username: &str) -> SqlResult<Option<Pilot>> {
    conn.query_row(
        "SELECT id, username FROM pilots WHERE username = ?1",
        params![username],
        |row| {
            Ok(Pilot {
                id: row.get(0)?,
                username: row.get(1)?,
            })
        },
    )
    .optional()
}

fn server_from_row(row: &Row) -> SqlResult<StatsServer> {
    Ok(StatsServer {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        engine: row.get(3)?,
    })
}

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const DB_DATE_FORMAT: &str = "%Y-%m-%d";

/// Format a timestamp for storage. The fixed width keeps text ordering
/// identical to time ordering.
pub(crate) fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

pub(crate) fn format_db_date(d: NaiveDate) -> String {
    d.format(DB_DATE_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

fn conversion_error(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unparseable date/time {:?}", value).into(),
    )
}

/// Read a timestamp column.
pub(crate) fn time_col(row: &Row, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| conversion_error(idx, &s))
}

/// Read a date column.
pub(crate) fn date_col(row: &Row, idx: usize) -> SqlResult<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, DB_DATE_FORMAT).map_err(|_| conversion_error(idx, &s))
}

/// Read a nullable date column.
pub(crate) fn opt_date_col(row: &Row, idx: usize) -> SqlResult<Option<NaiveDate>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| NaiveDate::parse_from_str(&s, DB_DATE_FORMAT).map_err(|_| conversion_error(idx, &s)))
        .transpose()
}
