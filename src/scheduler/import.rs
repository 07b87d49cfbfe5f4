//! Sortie import job.

use reqwest::Url;
use serde::Serialize;

use super::JobError;
use crate::db::{PageTarget, Store};
use crate::reconcile::{reconcile_sortie, Outcome};
use crate::scrape::{Fetcher, Scraper, StatsSite};

/// Which stats pages and tours to import. Everything when empty.
#[derive(Debug, Clone, Default)]
pub struct ImportFilter {
    pub pilot: Option<String>,
    pub server: Option<String>,
    pub tour: Option<i64>,
}

/// Counters reported by one import run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub pages: usize,
    pub tours: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    /// Pages or tours abandoned after a fetch, parse or store failure.
    pub failed_units: usize,
}

impl ImportSummary {
    fn count(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created { .. } => self.created += 1,
            Outcome::Updated { changed: true } => self.updated += 1,
            Outcome::Updated { changed: false } => self.unchanged += 1,
            Outcome::Rejected(_) => self.rejected += 1,
        }
    }
}

/// Resolve the filter against the store into the pages to visit.
pub fn select_pages(store: &Store, filter: &ImportFilter) -> Result<Vec<PageTarget>, JobError> {
    if filter.pilot.is_some() && filter.server.is_some() {
        return Err(JobError::ConflictingFilters);
    }
    let pilot_id = match &filter.pilot {
        Some(name) => Some(
            store
                .get_pilot_by_username(name)?
                .ok_or_else(|| JobError::UnknownPilot(name.clone()))?
                .id,
        ),
        None => None,
    };
    let server_id = match &filter.server {
        Some(name) => Some(
            store
                .get_server_by_name(name)?
                .ok_or_else(|| JobError::UnknownServer(name.clone()))?
                .id,
        ),
        None => None,
    };
    Ok(store.get_page_targets(pilot_id, server_id)?)
}

/// Import sorties for every selected stats page, one page at a time.
///
/// Failures are logged and counted per page or per tour; they never stop the
/// remaining pages.
pub async fn import_sorties(store: &Store, fetcher: &Fetcher, filter: &ImportFilter) -> Result<ImportSummary, JobError> {
    let targets = select_pages(store, filter)?;
    tracing::info!(pages = targets.len(), tour = ?filter.tour, "starting sortie import");

    let mut summary = ImportSummary::default();
    for target in &targets {
        let site = match Scraper::for_engine(fetcher.clone(), &target.server.engine) {
            Ok(site) => site,
            Err(e) => {
                tracing::error!(server = %target.server.name, error = %e, "cannot scrape server");
                summary.failed_units += 1;
                continue;
            }
        };
        import_page(store, &site, target, filter.tour, &mut summary).await;
    }

    tracing::info!(?summary, "sortie import finished");
    Ok(summary)
}

/// Import one stats page: all listed tours, or only `tour` when given.
pub async fn import_page<S: StatsSite>(
    store: &Store,
    site: &S,
    target: &PageTarget,
    tour: Option<i64>,
    summary: &mut ImportSummary,
) {
    let pilot = &target.pilot.username;
    let server = &target.server.name;
    summary.pages += 1;

    let page_url = match Url::parse(&target.page.url) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(pilot = %pilot, server = %server, url = %target.page.url, error = %e, "bad stats page URL");
            summary.failed_units += 1;
            return;
        }
    };

    let mut tours = match tour {
        Some(tour) => vec![tour],
        None => match site.discover_tours(&page_url).await {
            Ok(tours) => tours,
            Err(e) => {
                tracing::error!(
                    pilot = %pilot,
                    server = %server,
                    transient = e.is_transient(),
                    error = %e,
                    "tour discovery failed"
                );
                summary.failed_units += 1;
                return;
            }
        },
    };

    // Oldest tour first, so lives are built in the order they were flown.
    tours.sort_unstable();
    tours.dedup();
    for tour_id in tours {
        summary.tours += 1;
        if let Err(e) = import_tour(store, site, target, &page_url, tour_id, summary).await {
            tracing::error!(pilot = %pilot, server = %server, tour = tour_id, error = %e, "tour import aborted");
            summary.failed_units += 1;
        }
    }
}

async fn import_tour<S: StatsSite>(
    store: &Store,
    site: &S,
    target: &PageTarget,
    page_url: &Url,
    tour_id: i64,
    summary: &mut ImportSummary,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let refs = site.list_sorties(page_url, tour_id).await?;
    tracing::info!(
        pilot = %target.pilot.username,
        server = %target.server.name,
        tour = tour_id,
        sorties = refs.len(),
        "listed sorties"
    );

    // Index pages list the newest sortie first; reconcile in flight order.
    let mut records = Vec::with_capacity(refs.len());
    for reference in refs {
        records.push(site.scrape_sortie(&reference).await?);
    }
    records.sort_by_key(|r| r.start_at);

    for record in &records {
        let outcome = reconcile_sortie(store, &target.pilot, record)?;
        summary.count(&outcome);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::temp_store;
    use crate::db::Points;
    use crate::scrape::fixtures::{pilot_page, sortie_index, sortie_log, SortieFixture};
    use crate::scrape::{PilotStatus, Roster, ScrapeError, SortieRecord};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    #[test]
    fn test_select_pages_filters() {
        let (_tmp, store) = temp_store();
        let server = store.add_server("S", "http://s", None).unwrap();
        let pilot = store.add_pilot("Ace").unwrap();
        store.set_stats_page(pilot.id, server.id, "http://s/en/pilot/1/Ace/").unwrap();

        let all = select_pages(&store, &ImportFilter::default()).unwrap();
        assert_eq!(all.len(), 1);

        let both = ImportFilter {
            pilot: Some("Ace".into()),
            server: Some("S".into()),
            tour: None,
        };
        assert!(matches!(select_pages(&store, &both), Err(JobError::ConflictingFilters)));

        let unknown = ImportFilter {
            pilot: Some("Nobody".into()),
            ..Default::default()
        };
        assert!(matches!(select_pages(&store, &unknown), Err(JobError::UnknownPilot(_))));

        let unknown = ImportFilter {
            server: Some("Elsewhere".into()),
            ..Default::default()
        };
        assert!(matches!(select_pages(&store, &unknown), Err(JobError::UnknownServer(_))));
    }

    #[tokio::test]
    async fn test_import_two_sorties_into_open_life() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/en/pilot/1/Ace/")
            .with_status(200)
            .with_body(pilot_page(&[7]))
            .create_async()
            .await;
        server
            .mock("GET", "/en/sorties/1/Ace/?tour=7")
            .with_status(200)
            .with_body(sortie_index(&["/en/sortie/30/?tour=7", "/en/sortie/31/?tour=7"]))
            .create_async()
            .await;
        server
            .mock("GET", "/en/sortie/log/30/?tour=7")
            .with_status(200)
            .with_body(sortie_log(&SortieFixture {
                start: "12.03.2024 18:00:00",
                end: "12.03.2024 18:40:00",
                sortie_points: "10.25",
                ..Default::default()
            }))
            .create_async()
            .await;
        server
            .mock("GET", "/en/sortie/log/31/?tour=7")
            .with_status(200)
            .with_body(sortie_log(&SortieFixture {
                start: "12.03.2024 19:00:00",
                end: "12.03.2024 19:30:00",
                sortie_points: "7.5",
                air_points: "0",
                ..Default::default()
            }))
            .create_async()
            .await;

        let (_tmp, store) = temp_store();
        let stats = store.add_server("Finnish", &server.url(), None).unwrap();
        let pilot = store.add_pilot("Ace").unwrap();
        store
            .set_stats_page(pilot.id, stats.id, &format!("{}/en/pilot/1/Ace/", server.url()))
            .unwrap();
        let life = store
            .open_life(pilot.id, chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .unwrap();

        let fetcher = Fetcher::new(Duration::from_secs(5), "squadstats-test").unwrap();
        let summary = import_sorties(&store, &fetcher, &ImportFilter::default()).await.unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                pages: 1,
                tours: 1,
                created: 2,
                ..Default::default()
            }
        );

        let lives = store.get_lives(pilot.id).unwrap();
        assert_eq!(lives.len(), 1);
        assert_eq!(lives[0].id, life.id);
        assert_eq!(lives[0].points.sortie, Points(1775));
        assert_eq!(lives[0].points.air_combat, Points(20000));
        assert_eq!(lives[0].flight_time, 70 * 60);
        assert_eq!(store.get_pilot_sorties(pilot.id).unwrap().len(), 2);

        // A second run only revisits the same records.
        let again = import_sorties(&store, &fetcher, &ImportFilter::default()).await.unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.unchanged, 2);
    }

    /// Site double: tour 1 cannot be listed, tour 2 has one good sortie and one
    /// that fails to parse.
    struct FlakySite;

    fn good_record(sortie_id: i64) -> SortieRecord {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 10, 0, 0).unwrap();
        SortieRecord {
            sortie_id,
            tour_id: 2,
            aircraft: "P-40E-1".to_string(),
            start_at: start,
            end_at: start + ChronoDuration::minutes(20),
            air_kills: 0,
            ground_kills: 1,
            ship_kills: 0,
            status: PilotStatus::Alive,
            points: Default::default(),
        }
    }

    impl StatsSite for FlakySite {
        async fn discover_tours(&self, _stats_page: &Url) -> Result<Vec<i64>, ScrapeError> {
            Ok(vec![1, 2])
        }

        async fn list_sorties(&self, _stats_page: &Url, tour_id: i64) -> Result<Vec<Url>, ScrapeError> {
            match tour_id {
                1 => Err(ScrapeError::NoTours { url: "http://s".into() }),
                _ => Ok(vec![
                    Url::parse("http://s/en/sortie/1/").unwrap(),
                    Url::parse("http://s/en/sortie/2/").unwrap(),
                ]),
            }
        }

        async fn scrape_sortie(&self, reference: &Url) -> Result<SortieRecord, ScrapeError> {
            if reference.path().contains("/2/") {
                return Err(ScrapeError::parse("Sortie start", "garbled"));
            }
            Ok(good_record(1))
        }

        async fn scrape_roster(&self, _server_url: &Url) -> Result<Roster, ScrapeError> {
            Ok(Roster::default())
        }
    }

    #[tokio::test]
    async fn test_failures_stay_within_their_unit() {
        let (_tmp, store) = temp_store();
        let server = store.add_server("S", "http://s", None).unwrap();
        let a = store.add_pilot("A").unwrap();
        store.set_stats_page(a.id, server.id, "http://s/en/pilot/1/A/").unwrap();

        let mut summary = ImportSummary::default();
        for target in select_pages(&store, &ImportFilter::default()).unwrap() {
            import_page(&store, &FlakySite, &target, None, &mut summary).await;
        }

        // Tour 1 failed to list; tour 2 was abandoned at the parse error
        // before anything was stored.
        assert_eq!(summary.tours, 2);
        assert_eq!(summary.created, 0);
        assert_eq!(summary.failed_units, 2);
        assert!(store.get_sortie(1).unwrap().is_none());
    }

    /// Site double listing one tour newest sortie first: sortie 2 was flown
    /// after the pilot was killed in sortie 1.
    struct NewestFirstSite;

    impl StatsSite for NewestFirstSite {
        async fn discover_tours(&self, _stats_page: &Url) -> Result<Vec<i64>, ScrapeError> {
            Ok(vec![2])
        }

        async fn list_sorties(&self, _stats_page: &Url, _tour_id: i64) -> Result<Vec<Url>, ScrapeError> {
            Ok(vec![
                Url::parse("http://s/en/sortie/2/").unwrap(),
                Url::parse("http://s/en/sortie/1/").unwrap(),
            ])
        }

        async fn scrape_sortie(&self, reference: &Url) -> Result<SortieRecord, ScrapeError> {
            if reference.path().contains("/2/") {
                let mut later = good_record(2);
                later.start_at = later.start_at + ChronoDuration::days(4);
                later.end_at = later.end_at + ChronoDuration::days(4);
                return Ok(later);
            }
            let mut fatal = good_record(1);
            fatal.status = PilotStatus::Killed;
            Ok(fatal)
        }

        async fn scrape_roster(&self, _server_url: &Url) -> Result<Roster, ScrapeError> {
            Ok(Roster::default())
        }
    }

    #[tokio::test]
    async fn test_newest_first_index_builds_lives_in_flight_order() {
        let (_tmp, store) = temp_store();
        let server = store.add_server("S", "http://s", None).unwrap();
        let pilot = store.add_pilot("A").unwrap();
        store.set_stats_page(pilot.id, server.id, "http://s/en/pilot/1/A/").unwrap();

        let mut summary = ImportSummary::default();
        for target in select_pages(&store, &ImportFilter::default()).unwrap() {
            import_page(&store, &NewestFirstSite, &target, None, &mut summary).await;
        }
        assert_eq!(summary.created, 2);

        let lives = store.get_lives(pilot.id).unwrap();
        assert_eq!(lives.len(), 2);
        assert_eq!(lives[1].number, 1);
        assert_eq!(lives[1].end_date, Some(chrono::NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()));
        assert!(lives[0].is_open());
        assert_eq!(lives[0].start_date, chrono::NaiveDate::from_ymd_opt(2024, 4, 5).unwrap());
        assert_eq!(store.get_sortie(1).unwrap().unwrap().virtual_life_id, lives[1].id);
        assert_eq!(store.get_sortie(2).unwrap().unwrap().virtual_life_id, lives[0].id);
        for life in &lives {
            assert!(life.end_date.map_or(true, |end| end >= life.start_date));
        }
    }
}
