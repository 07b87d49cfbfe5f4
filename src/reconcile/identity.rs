//! Roster sightings: observed players, their name history and samples.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::db::identity as q;
use crate::db::{find_pilot_by_username, Coalition, DbError, SomePilot, StatsServer, Store};
use crate::scrape::RosterEntry;

/// Record one roster sighting of a player on `server` at `now`.
///
/// Resolves or creates the player, bumps the sighting count for `coalition`,
/// refreshes the squad link and the name history, and appends one occurrence
/// sample. Returns the player as stored afterwards.
pub fn record_sighting(
    store: &Store,
    server: &StatsServer,
    entry: &RosterEntry,
    coalition: Coalition,
    now: DateTime<Utc>,
) -> Result<SomePilot, DbError> {
    store.transaction(|conn| {
        let player = match q::find_some_pilot(conn, entry.site_id)? {
            Some(player) => player,
            None => {
                tracing::info!(server = %server.name, site_id = entry.site_id, name = %entry.name, "new player");
                q::create_some_pilot(conn, server.id, entry.site_id)?
            }
        };

        q::increment_sightings(conn, player.id, coalition)?;

        if let Some(pilot) = find_pilot_by_username(conn, &entry.name)? {
            q::set_squad_link(conn, player.id, pilot.id)?;
        }

        update_name_history(conn, player.id, entry, now)?;
        q::add_occurrence(conn, server.id, player.id, coalition, now)?;

        q::find_some_pilot(conn, entry.site_id)?.ok_or(DbError::NotFound)
    })
}

fn update_name_history(
    conn: &Connection,
    some_pilot_id: i64,
    entry: &RosterEntry,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let current = q::current_name(conn, some_pilot_id)?;
    if let Some(current) = &current {
        if current.name == entry.name {
            q::touch_name(conn, current.id, &entry.url, now)?;
            return Ok(());
        }
    }

    q::clear_current(conn, some_pilot_id)?;
    match q::find_name(conn, some_pilot_id, &entry.name)? {
        Some(known) => q::promote_name(conn, known.id, &entry.url, now)?,
        None => {
            q::insert_current_name(conn, some_pilot_id, &entry.name, &entry.url, now)?;
        }
    }
    tracing::info!(
        site_id = entry.site_id,
        old = current.as_ref().map(|n| n.name.as_str()).unwrap_or("-"),
        new = %entry.name,
        "player name changed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::temp_store;
    use chrono::{Duration, TimeZone};

    fn entry(site_id: i64, name: &str) -> RosterEntry {
        RosterEntry {
            site_id,
            name: name.to_string(),
            url: format!("http://s/en/pilot/{}", site_id),
        }
    }

    fn current_count(store: &Store, some_pilot_id: i64) -> usize {
        store
            .get_names(some_pilot_id)
            .unwrap()
            .iter()
            .filter(|n| n.is_current)
            .count()
    }

    #[test]
    fn test_first_sighting_creates_player() {
        let (_tmp, store) = temp_store();
        let server = store.add_server("S", "http://s", None).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap();

        let player = record_sighting(&store, &server, &entry(77, "Wolf"), Coalition::Blue, now).unwrap();
        assert_eq!(player.site_id, 77);
        assert_eq!(player.server_id, server.id);
        assert_eq!(player.blue_count, 1);
        assert_eq!(player.red_count, 0);
        assert_eq!(player.squad_pilot_id, None);

        let name = store.current_name(player.id).unwrap().unwrap();
        assert_eq!(name.name, "Wolf");
        assert_eq!(name.first_seen, now);
        assert_eq!(name.last_seen, now);
        assert_eq!(store.count_occurrences(server.id).unwrap(), 1);
    }

    #[test]
    fn test_same_name_only_touches() {
        let (_tmp, store) = temp_store();
        let server = store.add_server("S", "http://s", None).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap();

        record_sighting(&store, &server, &entry(77, "Wolf"), Coalition::Red, t).unwrap();
        let player = record_sighting(&store, &server, &entry(77, "Wolf"), Coalition::Red, t + Duration::minutes(5))
            .unwrap();

        assert_eq!(player.red_count, 2);
        let names = store.get_names(player.id).unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].first_seen, t);
        assert_eq!(names[0].last_seen, t + Duration::minutes(5));
        assert_eq!(store.count_occurrences(server.id).unwrap(), 2);
    }

    #[test]
    fn test_name_change_keeps_history() {
        let (_tmp, store) = temp_store();
        let server = store.add_server("S", "http://s", None).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap();

        record_sighting(&store, &server, &entry(77, "Wolf"), Coalition::Red, t).unwrap();
        let player = record_sighting(&store, &server, &entry(77, "Wolf_II"), Coalition::Red, t + Duration::hours(1))
            .unwrap();

        assert_eq!(current_count(&store, player.id), 1);
        assert_eq!(store.current_name(player.id).unwrap().unwrap().name, "Wolf_II");
        let old = store
            .get_names(player.id)
            .unwrap()
            .into_iter()
            .find(|n| n.name == "Wolf")
            .unwrap();
        assert!(!old.is_current);

        // Switching back promotes the historical record instead of adding one.
        let player = record_sighting(&store, &server, &entry(77, "Wolf"), Coalition::Blue, t + Duration::hours(2))
            .unwrap();
        let names = store.get_names(player.id).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(current_count(&store, player.id), 1);
        let current = store.current_name(player.id).unwrap().unwrap();
        assert_eq!(current.name, "Wolf");
        assert_eq!(current.first_seen, t);
        assert_eq!(current.last_seen, t + Duration::hours(2));
        assert_eq!((player.red_count, player.blue_count), (2, 1));
    }

    #[test]
    fn test_squad_link_follows_name() {
        let (_tmp, store) = temp_store();
        let server = store.add_server("S", "http://s", None).unwrap();
        let ace = store.add_pilot("Ace").unwrap();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap();

        let player = record_sighting(&store, &server, &entry(5, "Stranger"), Coalition::Red, t).unwrap();
        assert_eq!(player.squad_pilot_id, None);

        let player = record_sighting(&store, &server, &entry(5, "Ace"), Coalition::Red, t).unwrap();
        assert_eq!(player.squad_pilot_id, Some(ace.id));

        // An unmatched later name keeps the last link.
        let player = record_sighting(&store, &server, &entry(5, "Ace_alt"), Coalition::Red, t).unwrap();
        assert_eq!(player.squad_pilot_id, Some(ace.id));
    }
}
