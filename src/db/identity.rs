//! Queries on observed players, their name history and roster samples.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};

use super::models::*;
use super::store::{format_db_time, time_col};

fn some_pilot_from_row(row: &Row) -> SqlResult<SomePilot> {
    Ok(SomePilot {
        id: row.get(0)?,
        server_id: row.get(1)?,
        site_id: row.get(2)?,
        red_count: row.get(3)?,
        blue_count: row.get(4)?,
        squad_pilot_id: row.get(5)?,
    })
}

fn name_from_row(row: &Row) -> SqlResult<SomePilotName> {
    Ok(SomePilotName {
        id: row.get(0)?,
        some_pilot_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        first_seen: time_col(row, 4)?,
        last_seen: time_col(row, 5)?,
        is_current: row.get(6)?,
    })
}

pub(crate) fn occurrence_from_row(row: &Row) -> SqlResult<PlayerOccurrence> {
    let coalition: String = row.get(3)?;
    let coalition = Coalition::parse(&coalition).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, format!("unknown coalition {:?}", coalition).into())
    })?;
    Ok(PlayerOccurrence {
        id: row.get(0)?,
        server_id: row.get(1)?,
        some_pilot_id: row.get(2)?,
        coalition,
        timestamp: time_col(row, 4)?,
    })
}

const NAME_COLUMNS: &str = "id, some_pilot_id, name, url, first_seen, last_seen, is_current";

// --- Some pilots ---

pub fn find_some_pilot(conn: &Connection, site_id: i64) -> SqlResult<Option<SomePilot>> {
    conn.query_row(
        "SELECT id, server_id, site_id, red_count, blue_count, squad_pilot_id
         FROM some_pilots WHERE site_id = ?1",
        params![site_id],
        some_pilot_from_row,
    )
    .optional()
}

/// Create a player with no sightings and no squad link.
pub fn create_some_pilot(conn: &Connection, server_id: i64, site_id: i64) -> SqlResult<SomePilot> {
    conn.execute(
        "INSERT INTO some_pilots (server_id, site_id) VALUES (?1, ?2)",
        params![server_id, site_id],
    )?;
    Ok(SomePilot {
        id: conn.last_insert_rowid(),
        server_id,
        site_id,
        red_count: 0,
        blue_count: 0,
        squad_pilot_id: None,
    })
}

pub fn increment_sightings(conn: &Connection, some_pilot_id: i64, coalition: Coalition) -> SqlResult<()> {
    let sql = match coalition {
        Coalition::Red => "UPDATE some_pilots SET red_count = red_count + 1 WHERE id = ?1",
        Coalition::Blue => "UPDATE some_pilots SET blue_count = blue_count + 1 WHERE id = ?1",
    };
    conn.execute(sql, params![some_pilot_id])?;
    Ok(())
}

pub fn set_squad_link(conn: &Connection, some_pilot_id: i64, pilot_id: i64) -> SqlResult<()> {
    conn.execute(
        "UPDATE some_pilots SET squad_pilot_id = ?1 WHERE id = ?2",
        params![pilot_id, some_pilot_id],
    )?;
    Ok(())
}

// --- Names ---

/// Name history of a player, most recently seen first.
pub fn names(conn: &Connection, some_pilot_id: i64) -> SqlResult<Vec<SomePilotName>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM some_pilot_names WHERE some_pilot_id = ?1 ORDER BY last_seen DESC, name",
        NAME_COLUMNS
    ))?;
    let names = stmt
        .query_map(params![some_pilot_id], name_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(names)
}

pub fn current_name(conn: &Connection, some_pilot_id: i64) -> SqlResult<Option<SomePilotName>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM some_pilot_names WHERE some_pilot_id = ?1 AND is_current = 1",
            NAME_COLUMNS
        ),
        params![some_pilot_id],
        name_from_row,
    )
    .optional()
}

pub fn find_name(conn: &Connection, some_pilot_id: i64, name: &str) -> SqlResult<Option<SomePilotName>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM some_pilot_names WHERE some_pilot_id = ?1 AND name = ?2",
            NAME_COLUMNS
        ),
        params![some_pilot_id, name],
        name_from_row,
    )
    .optional()
}

pub fn touch_name(conn: &Connection, name_id: i64, url: &str, seen: DateTime<Utc>) -> SqlResult<()> {
    conn.execute(
        "UPDATE some_pilot_names SET last_seen = ?1, url = ?2 WHERE id = ?3",
        params![format_db_time(seen), url, name_id],
    )?;
    Ok(())
}

/// Clear the current flag on every name of a player.
pub fn clear_current(conn: &Connection, some_pilot_id: i64) -> SqlResult<()> {
    conn.execute(
        "UPDATE some_pilot_names SET is_current = 0 WHERE some_pilot_id = ?1 AND is_current = 1",
        params![some_pilot_id],
    )?;
    Ok(())
}

/// Mark a stored name current. Call `clear_current` first.
pub fn promote_name(conn: &Connection, name_id: i64, url: &str, seen: DateTime<Utc>) -> SqlResult<()> {
    conn.execute(
        "UPDATE some_pilot_names SET is_current = 1, last_seen = ?1, url = ?2 WHERE id = ?3",
        params![format_db_time(seen), url, name_id],
    )?;
    Ok(())
}

/// Insert a new current name. Call `clear_current` first.
pub fn insert_current_name(
    conn: &Connection,
    some_pilot_id: i64,
    name: &str,
    url: &str,
    seen: DateTime<Utc>,
) -> SqlResult<SomePilotName> {
    let ts = format_db_time(seen);
    conn.execute(
        "INSERT INTO some_pilot_names (some_pilot_id, name, url, first_seen, last_seen, is_current)
         VALUES (?1, ?2, ?3, ?4, ?4, 1)",
        params![some_pilot_id, name, url, ts],
    )?;
    Ok(SomePilotName {
        id: conn.last_insert_rowid(),
        some_pilot_id,
        name: name.to_string(),
        url: url.to_string(),
        first_seen: seen,
        last_seen: seen,
        is_current: true,
    })
}

// --- Occurrences ---

/// Append one roster sample.
pub fn add_occurrence(
    conn: &Connection,
    server_id: i64,
    some_pilot_id: i64,
    coalition: Coalition,
    timestamp: DateTime<Utc>,
) -> SqlResult<i64> {
    conn.execute(
        "INSERT INTO player_occurrences (server_id, some_pilot_id, coalition, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![server_id, some_pilot_id, coalition.as_str(), format_db_time(timestamp)],
    )?;
    Ok(conn.last_insert_rowid())
}
