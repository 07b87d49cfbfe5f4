//! Queries on virtual lives, sorties and aircraft.
//!
//! These take a bare connection so they can be composed inside one
//! transaction by the reconciler.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};

use super::models::*;
use super::store::{date_col, format_db_date, format_db_time, opt_date_col, time_col};

const LIFE_COLUMNS: &str = "id, pilot_id, number, start_date, end_date, flight_time, was_wounded, \
     air_kills, ground_kills, ship_kills, sortie_points, air_combat_points, ground_combat_points, \
     ship_combat_points, leadership_points, nco_points";

const SORTIE_COLUMNS: &str = "s.id, s.virtual_life_id, s.aircraft_id, s.start_at, s.end_at, s.was_wounded, \
     s.air_kills, s.ground_kills, s.ship_kills, s.sortie_points, s.air_combat_points, \
     s.ground_combat_points, s.ship_combat_points, s.leadership_points, s.nco_points, \
     s.tour_id, s.sortie_id";

fn points_at(row: &Row, first: usize) -> SqlResult<PointTotals> {
    Ok(PointTotals {
        sortie: Points(row.get(first)?),
        air_combat: Points(row.get(first + 1)?),
        ground_combat: Points(row.get(first + 2)?),
        ship_combat: Points(row.get(first + 3)?),
        leadership: Points(row.get(first + 4)?),
        nco: Points(row.get(first + 5)?),
    })
}

fn life_from_row(row: &Row) -> SqlResult<VirtualLife> {
    Ok(VirtualLife {
        id: row.get(0)?,
        pilot_id: row.get(1)?,
        number: row.get(2)?,
        start_date: date_col(row, 3)?,
        end_date: opt_date_col(row, 4)?,
        flight_time: row.get(5)?,
        was_wounded: row.get(6)?,
        air_kills: row.get(7)?,
        ground_kills: row.get(8)?,
        ship_kills: row.get(9)?,
        points: points_at(row, 10)?,
    })
}

fn sortie_from_row(row: &Row) -> SqlResult<Sortie> {
    Ok(Sortie {
        id: row.get(0)?,
        virtual_life_id: row.get(1)?,
        aircraft_id: row.get(2)?,
        start_at: time_col(row, 3)?,
        end_at: time_col(row, 4)?,
        was_wounded: row.get(5)?,
        air_kills: row.get(6)?,
        ground_kills: row.get(7)?,
        ship_kills: row.get(8)?,
        points: points_at(row, 9)?,
        tour_id: row.get(15)?,
        sortie_id: row.get(16)?,
    })
}

// --- Aircraft ---

/// Id of the aircraft with the given name, creating it on first use.
pub fn aircraft_id(conn: &Connection, name: &str) -> SqlResult<i64> {
    conn.execute(
        "INSERT INTO aircraft (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
        params![name],
    )?;
    conn.query_row("SELECT id FROM aircraft WHERE name = ?1", params![name], |r| r.get(0))
}

// --- Virtual lives ---

pub fn find_life(conn: &Connection, id: i64) -> SqlResult<Option<VirtualLife>> {
    conn.query_row(
        &format!("SELECT {} FROM virtual_lives WHERE id = ?1", LIFE_COLUMNS),
        params![id],
        life_from_row,
    )
    .optional()
}

pub fn open_life(conn: &Connection, pilot_id: i64) -> SqlResult<Option<VirtualLife>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM virtual_lives WHERE pilot_id = ?1 AND end_date IS NULL",
            LIFE_COLUMNS
        ),
        params![pilot_id],
        life_from_row,
    )
    .optional()
}

/// All lives of a pilot, latest first.
pub fn pilot_lives(conn: &Connection, pilot_id: i64) -> SqlResult<Vec<VirtualLife>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM virtual_lives WHERE pilot_id = ?1 ORDER BY number DESC",
        LIFE_COLUMNS
    ))?;
    let lives = stmt
        .query_map(params![pilot_id], life_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(lives)
}

/// Open a new life numbered one past the pilot's last one.
///
/// Fails on the open-life unique index if the pilot already has an open life.
pub fn create_life(conn: &Connection, pilot_id: i64, start_date: NaiveDate) -> SqlResult<VirtualLife> {
    let number: i64 = conn.query_row(
        "SELECT COALESCE(MAX(number), 0) + 1 FROM virtual_lives WHERE pilot_id = ?1",
        params![pilot_id],
        |r| r.get(0),
    )?;
    conn.execute(
        "INSERT INTO virtual_lives (pilot_id, number, start_date) VALUES (?1, ?2, ?3)",
        params![pilot_id, number, format_db_date(start_date)],
    )?;
    Ok(VirtualLife {
        id: conn.last_insert_rowid(),
        pilot_id,
        number,
        start_date,
        end_date: None,
        flight_time: 0,
        was_wounded: false,
        air_kills: 0,
        ground_kills: 0,
        ship_kills: 0,
        points: PointTotals::default(),
    })
}

pub fn close_life(conn: &Connection, life_id: i64, end_date: NaiveDate) -> SqlResult<()> {
    conn.execute(
        "UPDATE virtual_lives SET end_date = ?1 WHERE id = ?2",
        params![format_db_date(end_date), life_id],
    )?;
    Ok(())
}

pub fn set_life_start(conn: &Connection, life_id: i64, start_date: NaiveDate) -> SqlResult<()> {
    conn.execute(
        "UPDATE virtual_lives SET start_date = ?1 WHERE id = ?2",
        params![format_db_date(start_date), life_id],
    )?;
    Ok(())
}

/// End of the latest sortie stored in a life, if it has any.
pub fn life_last_landing(conn: &Connection, life_id: i64) -> SqlResult<Option<DateTime<Utc>>> {
    conn.query_row(
        "SELECT end_at FROM sorties WHERE virtual_life_id = ?1 ORDER BY end_at DESC LIMIT 1",
        params![life_id],
        |r| time_col(r, 0),
    )
    .optional()
}

/// Add a (possibly negative) contribution to a life's running totals.
pub fn add_contribution(conn: &Connection, life_id: i64, delta: &Contribution) -> SqlResult<()> {
    conn.execute(
        "UPDATE virtual_lives SET
            flight_time = flight_time + ?1,
            air_kills = air_kills + ?2,
            ground_kills = ground_kills + ?3,
            ship_kills = ship_kills + ?4,
            sortie_points = sortie_points + ?5,
            air_combat_points = air_combat_points + ?6,
            ground_combat_points = ground_combat_points + ?7,
            ship_combat_points = ship_combat_points + ?8,
            leadership_points = leadership_points + ?9,
            nco_points = nco_points + ?10
         WHERE id = ?11",
        params![
            delta.flight_time,
            delta.air_kills,
            delta.ground_kills,
            delta.ship_kills,
            delta.points.sortie.hundredths(),
            delta.points.air_combat.hundredths(),
            delta.points.ground_combat.hundredths(),
            delta.points.ship_combat.hundredths(),
            delta.points.leadership.hundredths(),
            delta.points.nco.hundredths(),
            life_id,
        ],
    )?;
    Ok(())
}

/// Recompute a life's wounded flag from its sorties.
pub fn refresh_life_wounded(conn: &Connection, life_id: i64) -> SqlResult<()> {
    conn.execute(
        "UPDATE virtual_lives SET was_wounded =
            EXISTS (SELECT 1 FROM sorties WHERE virtual_life_id = ?1 AND was_wounded = 1)
         WHERE id = ?1",
        params![life_id],
    )?;
    Ok(())
}

// --- Sorties ---

pub fn find_sortie(conn: &Connection, sortie_id: i64) -> SqlResult<Option<Sortie>> {
    conn.query_row(
        &format!("SELECT {} FROM sorties s WHERE s.sortie_id = ?1", SORTIE_COLUMNS),
        params![sortie_id],
        sortie_from_row,
    )
    .optional()
}

/// All sorties of a pilot across every life, oldest first.
pub fn pilot_sorties(conn: &Connection, pilot_id: i64) -> SqlResult<Vec<Sortie>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sorties s
         JOIN virtual_lives v ON v.id = s.virtual_life_id
         WHERE v.pilot_id = ?1
         ORDER BY s.start_at",
        SORTIE_COLUMNS
    ))?;
    let sorties = stmt
        .query_map(params![pilot_id], sortie_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(sorties)
}

/// Sorties of a pilot whose [start, end] interval intersects the given one,
/// optionally ignoring one remote sortie id.
pub fn overlapping_sorties(
    conn: &Connection,
    pilot_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    except_sortie_id: Option<i64>,
) -> SqlResult<Vec<Sortie>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sorties s
         JOIN virtual_lives v ON v.id = s.virtual_life_id
         WHERE v.pilot_id = ?1 AND s.start_at <= ?2 AND s.end_at >= ?3
           AND (?4 IS NULL OR s.sortie_id != ?4)
         ORDER BY s.start_at",
        SORTIE_COLUMNS
    ))?;
    let sorties = stmt
        .query_map(
            params![pilot_id, format_db_time(end), format_db_time(start), except_sortie_id],
            sortie_from_row,
        )?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(sorties)
}

/// Sorties of a life starting strictly after `after`, oldest first.
pub fn life_sorties_after(conn: &Connection, life_id: i64, after: DateTime<Utc>) -> SqlResult<Vec<Sortie>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sorties s WHERE s.virtual_life_id = ?1 AND s.start_at > ?2 ORDER BY s.start_at",
        SORTIE_COLUMNS
    ))?;
    let sorties = stmt
        .query_map(params![life_id, format_db_time(after)], sortie_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(sorties)
}

/// Reassign sorties, by row id, to another life.
pub fn move_sorties(conn: &Connection, sortie_ids: &[i64], to_life: i64) -> SqlResult<()> {
    let mut stmt = conn.prepare("UPDATE sorties SET virtual_life_id = ?1 WHERE id = ?2")?;
    for id in sortie_ids {
        stmt.execute(params![to_life, id])?;
    }
    Ok(())
}

/// Insert a sortie; `sortie.id` is ignored and the new row id returned.
pub fn insert_sortie(conn: &Connection, sortie: &Sortie) -> SqlResult<i64> {
    conn.execute(
        "INSERT INTO sorties (virtual_life_id, aircraft_id, start_at, end_at, was_wounded,
            air_kills, ground_kills, ship_kills, sortie_points, air_combat_points,
            ground_combat_points, ship_combat_points, leadership_points, nco_points,
            tour_id, sortie_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            sortie.virtual_life_id,
            sortie.aircraft_id,
            format_db_time(sortie.start_at),
            format_db_time(sortie.end_at),
            sortie.was_wounded,
            sortie.air_kills,
            sortie.ground_kills,
            sortie.ship_kills,
            sortie.points.sortie.hundredths(),
            sortie.points.air_combat.hundredths(),
            sortie.points.ground_combat.hundredths(),
            sortie.points.ship_combat.hundredths(),
            sortie.points.leadership.hundredths(),
            sortie.points.nco.hundredths(),
            sortie.tour_id,
            sortie.sortie_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Overwrite the mutable fields of a stored sortie, keyed by row id.
pub fn update_sortie(conn: &Connection, sortie: &Sortie) -> SqlResult<()> {
    conn.execute(
        "UPDATE sorties SET aircraft_id=?1, start_at=?2, end_at=?3, was_wounded=?4,
            air_kills=?5, ground_kills=?6, ship_kills=?7, sortie_points=?8,
            air_combat_points=?9, ground_combat_points=?10, ship_combat_points=?11,
            leadership_points=?12, nco_points=?13, tour_id=?14
         WHERE id=?15",
        params![
            sortie.aircraft_id,
            format_db_time(sortie.start_at),
            format_db_time(sortie.end_at),
            sortie.was_wounded,
            sortie.air_kills,
            sortie.ground_kills,
            sortie.ship_kills,
            sortie.points.sortie.hundredths(),
            sortie.points.air_combat.hundredths(),
            sortie.points.ground_combat.hundredths(),
            sortie.points.ship_combat.hundredths(),
            sortie.points.leadership.hundredths(),
            sortie.points.nco.hundredths(),
            sortie.tour_id,
            sortie.id,
        ],
    )?;
    Ok(())
}

/// Pilot owning a life.
pub fn life_owner(conn: &Connection, life_id: i64) -> SqlResult<Option<i64>> {
    conn.query_row(
        "SELECT pilot_id FROM virtual_lives WHERE id = ?1",
        params![life_id],
        |r| r.get(0),
    )
    .optional()
}
