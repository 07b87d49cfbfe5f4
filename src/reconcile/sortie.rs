//! Sortie reconciliation into virtual lives.
//!
//! A life spans from its first sortie to the sortie in which the pilot was
//! killed or captured. Records are placed by time, so a sortie scraped late or
//! out of order still lands in the life it was flown in.

use rusqlite::Connection;
use serde::Serialize;

use crate::db::sorties as q;
use crate::db::{Contribution, DbError, Pilot, Sortie, Store, VirtualLife};
use crate::scrape::SortieRecord;

/// Why a sortie record was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The record's interval intersects these stored sorties of the pilot.
    Overlap { conflicting: Vec<i64> },
    /// The remote sortie id is already stored for another pilot.
    ForeignSortie { owner: i64 },
    /// A fatal sortie falls inside an already ended life.
    LifeConflict { life_number: i64 },
}

/// Result of reconciling one sortie record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created { life_number: i64 },
    Updated { changed: bool },
    Rejected(RejectReason),
}

/// Store one scraped sortie for `pilot`, creating or updating it by remote id
/// and keeping the owning virtual life's totals in step.
pub fn reconcile_sortie(store: &Store, pilot: &Pilot, record: &SortieRecord) -> Result<Outcome, DbError> {
    let outcome = store.transaction(|conn| match q::find_sortie(conn, record.sortie_id)? {
        Some(existing) => update(conn, pilot, existing, record),
        None => insert(conn, pilot, record),
    })?;

    match &outcome {
        Outcome::Rejected(reason) => tracing::warn!(
            pilot = %pilot.username,
            sortie_id = record.sortie_id,
            tour = record.tour_id,
            ?reason,
            "sortie rejected"
        ),
        _ => tracing::info!(
            pilot = %pilot.username,
            sortie_id = record.sortie_id,
            tour = record.tour_id,
            ?outcome,
            "sortie reconciled"
        ),
    }
    Ok(outcome)
}

fn overlap(
    conn: &Connection,
    pilot: &Pilot,
    record: &SortieRecord,
    except: Option<i64>,
) -> Result<Option<RejectReason>, DbError> {
    let conflicting = q::overlapping_sorties(conn, pilot.id, record.start_at, record.end_at, except)?;
    if conflicting.is_empty() {
        return Ok(None);
    }
    Ok(Some(RejectReason::Overlap {
        conflicting: conflicting.iter().map(|s| s.sortie_id).collect(),
    }))
}

/// Stored form of a record, placed in the given row and life.
fn to_sortie(conn: &Connection, record: &SortieRecord, id: i64, virtual_life_id: i64) -> Result<Sortie, DbError> {
    Ok(Sortie {
        id,
        virtual_life_id,
        aircraft_id: q::aircraft_id(conn, &record.aircraft)?,
        start_at: record.start_at,
        end_at: record.end_at,
        was_wounded: record.status.was_wounded(),
        air_kills: record.air_kills,
        ground_kills: record.ground_kills,
        ship_kills: record.ship_kills,
        points: record.points,
        tour_id: record.tour_id,
        sortie_id: record.sortie_id,
    })
}

/// The life a sortie starting at `record.start_at` was flown in.
///
/// That is the earliest ended life whose last landing is not before the
/// record, otherwise the open life, otherwise a new one.
fn place(conn: &Connection, pilot: &Pilot, record: &SortieRecord) -> Result<Result<VirtualLife, RejectReason>, DbError> {
    let mut lives = q::pilot_lives(conn, pilot.id)?;
    lives.reverse();
    for life in lives {
        if life.is_open() {
            return Ok(Ok(life));
        }
        match q::life_last_landing(conn, life.id)? {
            Some(landing) if record.start_at <= landing => {
                if record.status.ends_life() {
                    return Ok(Err(RejectReason::LifeConflict {
                        life_number: life.number,
                    }));
                }
                return Ok(Ok(life));
            }
            _ => {}
        }
    }

    let life = q::create_life(conn, pilot.id, record.start_at.date_naive())?;
    tracing::info!(pilot = %pilot.username, life = life.number, "virtual life started");
    Ok(Ok(life))
}

/// End the open life at `record`. Sorties already stored after it move to a
/// new open life together with their share of the totals.
fn end_life(conn: &Connection, pilot: &Pilot, life: &VirtualLife, record: &SortieRecord) -> Result<(), DbError> {
    q::close_life(conn, life.id, record.end_at.date_naive())?;
    tracing::info!(pilot = %pilot.username, life = life.number, sortie_id = record.sortie_id, "virtual life ended");

    let later = q::life_sorties_after(conn, life.id, record.end_at)?;
    let Some(first) = later.first() else {
        return Ok(());
    };
    let next = q::create_life(conn, pilot.id, first.start_at.date_naive())?;
    let moved = later
        .iter()
        .fold(Contribution::default(), |acc, s| acc + s.contribution());
    let ids: Vec<i64> = later.iter().map(|s| s.id).collect();
    q::move_sorties(conn, &ids, next.id)?;
    q::add_contribution(conn, life.id, &(Contribution::default() - moved))?;
    q::add_contribution(conn, next.id, &moved)?;
    q::refresh_life_wounded(conn, life.id)?;
    q::refresh_life_wounded(conn, next.id)?;
    tracing::info!(
        pilot = %pilot.username,
        life = next.number,
        sorties = ids.len(),
        "later sorties moved to a new virtual life"
    );
    Ok(())
}

fn update(conn: &Connection, pilot: &Pilot, existing: Sortie, record: &SortieRecord) -> Result<Outcome, DbError> {
    let owner = q::life_owner(conn, existing.virtual_life_id)?.ok_or(DbError::NotFound)?;
    if owner != pilot.id {
        return Ok(Outcome::Rejected(RejectReason::ForeignSortie { owner }));
    }
    if let Some(reason) = overlap(conn, pilot, record, Some(record.sortie_id))? {
        return Ok(Outcome::Rejected(reason));
    }

    let fresh = to_sortie(conn, record, existing.id, existing.virtual_life_id)?;
    let mut changed = false;
    if fresh != existing {
        q::update_sortie(conn, &fresh)?;
        q::add_contribution(conn, existing.virtual_life_id, &(fresh.contribution() - existing.contribution()))?;
        q::refresh_life_wounded(conn, existing.virtual_life_id)?;
        changed = true;
    }
    if record.status.ends_life() {
        let life = q::find_life(conn, existing.virtual_life_id)?.ok_or(DbError::NotFound)?;
        if life.is_open() {
            end_life(conn, pilot, &life, record)?;
            changed = true;
        }
    }
    Ok(Outcome::Updated { changed })
}

fn insert(conn: &Connection, pilot: &Pilot, record: &SortieRecord) -> Result<Outcome, DbError> {
    if let Some(reason) = overlap(conn, pilot, record, None)? {
        return Ok(Outcome::Rejected(reason));
    }
    let life = match place(conn, pilot, record)? {
        Ok(life) => life,
        Err(reason) => return Ok(Outcome::Rejected(reason)),
    };

    let day = record.start_at.date_naive();
    if day < life.start_date {
        q::set_life_start(conn, life.id, day)?;
    }

    let sortie = to_sortie(conn, record, 0, life.id)?;
    q::insert_sortie(conn, &sortie)?;
    q::add_contribution(conn, life.id, &sortie.contribution())?;
    if sortie.was_wounded {
        q::refresh_life_wounded(conn, life.id)?;
    }
    if record.status.ends_life() && life.is_open() {
        end_life(conn, pilot, &life, record)?;
    }

    Ok(Outcome::Created {
        life_number: life.number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::temp_store;
    use crate::db::{PointTotals, Points, VirtualLife};
    use crate::scrape::PilotStatus;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 12, 18, 0, 0).unwrap()
    }

    fn record(sortie_id: i64, start_min: i64, len_min: i64) -> SortieRecord {
        SortieRecord {
            sortie_id,
            tour_id: 7,
            aircraft: "Yak-1 ser.69".to_string(),
            start_at: t0() + Duration::minutes(start_min),
            end_at: t0() + Duration::minutes(start_min + len_min),
            air_kills: 1,
            ground_kills: 0,
            ship_kills: 0,
            status: PilotStatus::Alive,
            points: PointTotals {
                sortie: Points(1050),
                air_combat: Points(20000),
                ..Default::default()
            },
        }
    }

    fn only_life(store: &Store, pilot: &Pilot) -> VirtualLife {
        let lives = store.get_lives(pilot.id).unwrap();
        assert_eq!(lives.len(), 1);
        lives.into_iter().next().unwrap()
    }

    #[test]
    fn test_create_then_reconcile_again_is_noop() {
        let (_tmp, store) = temp_store();
        let pilot = store.add_pilot("Ace").unwrap();
        let rec = record(100, 0, 30);

        assert_eq!(
            reconcile_sortie(&store, &pilot, &rec).unwrap(),
            Outcome::Created { life_number: 1 }
        );
        let life_before = only_life(&store, &pilot);
        let sorties_before = store.get_pilot_sorties(pilot.id).unwrap();

        assert_eq!(
            reconcile_sortie(&store, &pilot, &rec).unwrap(),
            Outcome::Updated { changed: false }
        );
        assert_eq!(only_life(&store, &pilot), life_before);
        assert_eq!(store.get_pilot_sorties(pilot.id).unwrap(), sorties_before);
        assert_eq!(life_before.flight_time, 30 * 60);
        assert_eq!(life_before.points.air_combat, Points(20000));
    }

    #[test]
    fn test_update_replaces_contribution() {
        let (_tmp, store) = temp_store();
        let pilot = store.add_pilot("Ace").unwrap();
        reconcile_sortie(&store, &pilot, &record(100, 0, 30)).unwrap();

        let mut rescored = record(100, 0, 30);
        rescored.points.air_combat = Points(15025);
        rescored.air_kills = 2;
        rescored.status = PilotStatus::Wounded;
        assert_eq!(
            reconcile_sortie(&store, &pilot, &rescored).unwrap(),
            Outcome::Updated { changed: true }
        );
        // Applying the same update twice must not double count.
        assert_eq!(
            reconcile_sortie(&store, &pilot, &rescored).unwrap(),
            Outcome::Updated { changed: false }
        );

        let life = only_life(&store, &pilot);
        assert_eq!(life.points.air_combat, Points(15025));
        assert_eq!(life.air_kills, 2);
        assert!(life.was_wounded);

        let stored = store.get_sortie(100).unwrap().unwrap();
        assert_eq!(stored.points, rescored.points);
    }

    #[test]
    fn test_overlap_rejected_without_side_effects() {
        let (_tmp, store) = temp_store();
        let pilot = store.add_pilot("Ace").unwrap();
        reconcile_sortie(&store, &pilot, &record(100, 0, 30)).unwrap();
        let life_before = only_life(&store, &pilot);
        let aircraft_before = store.get_aircraft().unwrap().len();

        let mut clash = record(101, 20, 30);
        clash.aircraft = "La-5 ser.8".to_string();
        assert_eq!(
            reconcile_sortie(&store, &pilot, &clash).unwrap(),
            Outcome::Rejected(RejectReason::Overlap { conflicting: vec![100] })
        );
        assert!(store.get_sortie(101).unwrap().is_none());
        assert_eq!(only_life(&store, &pilot), life_before);
        assert_eq!(store.get_aircraft().unwrap().len(), aircraft_before);

        // Touching endpoints also conflict.
        assert!(matches!(
            reconcile_sortie(&store, &pilot, &record(102, 30, 10)).unwrap(),
            Outcome::Rejected(RejectReason::Overlap { .. })
        ));
    }

    #[test]
    fn test_overlap_is_per_pilot() {
        let (_tmp, store) = temp_store();
        let a = store.add_pilot("A").unwrap();
        let b = store.add_pilot("B").unwrap();
        reconcile_sortie(&store, &a, &record(100, 0, 30)).unwrap();
        assert!(matches!(
            reconcile_sortie(&store, &b, &record(200, 0, 30)).unwrap(),
            Outcome::Created { .. }
        ));
    }

    #[test]
    fn test_foreign_sortie_rejected() {
        let (_tmp, store) = temp_store();
        let a = store.add_pilot("A").unwrap();
        let b = store.add_pilot("B").unwrap();
        reconcile_sortie(&store, &a, &record(100, 0, 30)).unwrap();
        assert_eq!(
            reconcile_sortie(&store, &b, &record(100, 0, 30)).unwrap(),
            Outcome::Rejected(RejectReason::ForeignSortie { owner: a.id })
        );
    }

    #[test]
    fn test_two_sorties_sum_into_open_life() {
        let (_tmp, store) = temp_store();
        let pilot = store.add_pilot("Ace").unwrap();
        let existing = store
            .open_life(pilot.id, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .unwrap();

        let first = record(100, 0, 30);
        let mut second = record(101, 60, 45);
        second.points.leadership = Points(500);
        reconcile_sortie(&store, &pilot, &first).unwrap();
        reconcile_sortie(&store, &pilot, &second).unwrap();

        let life = only_life(&store, &pilot);
        assert_eq!(life.id, existing.id);
        assert_eq!(life.points, first.points + second.points);
        assert_eq!(life.flight_time, 75 * 60);
        assert_eq!(life.air_kills, 2);
        assert_eq!(store.get_pilot_sorties(pilot.id).unwrap().len(), 2);
    }

    #[test]
    fn test_death_closes_life_and_next_sortie_opens_new_one() {
        let (_tmp, store) = temp_store();
        let pilot = store.add_pilot("Ace").unwrap();

        let mut fatal = record(100, 0, 30);
        fatal.status = PilotStatus::Killed;
        reconcile_sortie(&store, &pilot, &fatal).unwrap();
        assert!(store.get_open_life(pilot.id).unwrap().is_none());

        let next = record(101, 24 * 60, 30);
        assert_eq!(
            reconcile_sortie(&store, &pilot, &next).unwrap(),
            Outcome::Created { life_number: 2 }
        );

        let lives = store.get_lives(pilot.id).unwrap();
        assert_eq!(lives.len(), 2);
        assert_eq!(lives[0].number, 2);
        assert!(lives[0].is_open());
        assert_eq!(lives[0].start_date, next.start_at.date_naive());
        assert_eq!(lives[1].end_date, Some(fatal.end_at.date_naive()));
        assert_eq!(lives[1].points, fatal.points);
    }

    #[test]
    fn test_older_fatal_sortie_splits_the_open_life() {
        let (_tmp, store) = temp_store();
        let pilot = store.add_pilot("Ace").unwrap();

        let newer = record(200, 4 * 24 * 60, 30);
        let mut fatal = record(100, 0, 30);
        fatal.status = PilotStatus::Killed;
        fatal.points.air_combat = Points(5000);

        reconcile_sortie(&store, &pilot, &newer).unwrap();
        assert_eq!(
            reconcile_sortie(&store, &pilot, &fatal).unwrap(),
            Outcome::Created { life_number: 1 }
        );

        let lives = store.get_lives(pilot.id).unwrap();
        assert_eq!(lives.len(), 2);
        let (second, first) = (&lives[0], &lives[1]);

        assert_eq!(first.number, 1);
        assert_eq!(first.start_date, fatal.start_at.date_naive());
        assert_eq!(first.end_date, Some(fatal.end_at.date_naive()));
        assert_eq!(first.points, fatal.points);
        assert_eq!(first.flight_time, 30 * 60);
        assert_eq!(store.get_sortie(100).unwrap().unwrap().virtual_life_id, first.id);

        assert_eq!(second.number, 2);
        assert!(second.is_open());
        assert_eq!(second.start_date, newer.start_at.date_naive());
        assert_eq!(second.points, newer.points);
        assert_eq!(second.air_kills, 1);
        assert_eq!(store.get_sortie(200).unwrap().unwrap().virtual_life_id, second.id);

        // Re-scraping both changes nothing.
        assert_eq!(
            reconcile_sortie(&store, &pilot, &fatal).unwrap(),
            Outcome::Updated { changed: false }
        );
        assert_eq!(
            reconcile_sortie(&store, &pilot, &newer).unwrap(),
            Outcome::Updated { changed: false }
        );
        assert_eq!(store.get_lives(pilot.id).unwrap(), lives);
    }

    #[test]
    fn test_late_sortie_joins_the_life_it_was_flown_in() {
        let (_tmp, store) = temp_store();
        let pilot = store.add_pilot("Ace").unwrap();

        let mut fatal = record(100, 24 * 60, 30);
        fatal.status = PilotStatus::Killed;
        reconcile_sortie(&store, &pilot, &fatal).unwrap();
        reconcile_sortie(&store, &pilot, &record(101, 2 * 24 * 60, 30)).unwrap();

        let late = record(99, 0, 30);
        assert_eq!(
            reconcile_sortie(&store, &pilot, &late).unwrap(),
            Outcome::Created { life_number: 1 }
        );

        let lives = store.get_lives(pilot.id).unwrap();
        assert_eq!(lives.len(), 2);
        let first = &lives[1];
        assert_eq!(first.start_date, late.start_at.date_naive());
        assert_eq!(first.end_date, Some(fatal.end_at.date_naive()));
        assert_eq!(first.points, fatal.points + late.points);
        assert_eq!(lives[0].points, record(101, 0, 30).points);
    }

    #[test]
    fn test_fatal_sortie_inside_ended_life_rejected() {
        let (_tmp, store) = temp_store();
        let pilot = store.add_pilot("Ace").unwrap();

        let mut fatal = record(100, 24 * 60, 30);
        fatal.status = PilotStatus::Killed;
        reconcile_sortie(&store, &pilot, &fatal).unwrap();
        let before = store.get_lives(pilot.id).unwrap();

        let mut earlier = record(99, 0, 30);
        earlier.status = PilotStatus::Captured;
        assert_eq!(
            reconcile_sortie(&store, &pilot, &earlier).unwrap(),
            Outcome::Rejected(RejectReason::LifeConflict { life_number: 1 })
        );
        assert!(store.get_sortie(99).unwrap().is_none());
        assert_eq!(store.get_lives(pilot.id).unwrap(), before);
    }
}
