//! Scraping of remote stats sites.
//!
//! Page layout knowledge lives behind [`Extractor`], one implementation per
//! site engine. [`Scraper`] pairs an extractor with the shared [`Fetcher`] and
//! exposes the site operations used by the import jobs through [`StatsSite`].

mod fetch;
mod il2stats;

pub use fetch::*;
pub use il2stats::*;

use chrono::{DateTime, Utc};
use reqwest::Url;
use scraper::Html;
use serde::Serialize;
use thiserror::Error;

use crate::db::{Coalition, PointTotals};

/// Scrape error taxonomy.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not parse {field}: {detail}")]
    Parse { field: String, detail: String },
    #[error("no tours listed on {url}")]
    NoTours { url: String },
    #[error("section {selector} not found")]
    SectionNotFound { selector: String },
    #[error("cannot derive URL from {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unknown scraper engine {0:?}")]
    UnknownEngine(String),
}

impl ScrapeError {
    pub(crate) fn parse(field: impl Into<String>, detail: impl Into<String>) -> Self {
        ScrapeError::Parse {
            field: field.into(),
            detail: detail.into(),
        }
    }

    /// Whether trying again later may succeed without a code change.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScrapeError::Fetch(_))
    }
}

/// Final state of the pilot at the end of a sortie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PilotStatus {
    Alive,
    Wounded,
    Killed,
    Captured,
}

impl PilotStatus {
    pub fn was_wounded(&self) -> bool {
        matches!(self, PilotStatus::Wounded)
    }

    /// Killed or captured pilots start a new virtual life.
    pub fn ends_life(&self) -> bool {
        matches!(self, PilotStatus::Killed | PilotStatus::Captured)
    }
}

/// One sortie as read from its log page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortieRecord {
    pub sortie_id: i64,
    pub tour_id: i64,
    pub aircraft: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub air_kills: i64,
    pub ground_kills: i64,
    pub ship_kills: i64,
    pub status: PilotStatus,
    pub points: PointTotals,
}

/// A player listed on an online page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub site_id: i64,
    pub name: String,
    /// Absolute URL of the player's page.
    pub url: String,
}

/// One coalition block of an online page.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterSection {
    pub coalition: Coalition,
    pub entries: Vec<RosterEntry>,
}

/// Players currently online, split by coalition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    pub red: Vec<RosterEntry>,
    pub blue: Vec<RosterEntry>,
    /// Sections that could not be read; the rest of the page still counts.
    pub failed_sections: Vec<String>,
}

impl Roster {
    pub fn add_section(&mut self, section: RosterSection) {
        match section.coalition {
            Coalition::Red => self.red.extend(section.entries),
            Coalition::Blue => self.blue.extend(section.entries),
        }
    }

    /// All entries with their coalition, red first.
    pub fn sightings(&self) -> impl Iterator<Item = (Coalition, &RosterEntry)> {
        self.red
            .iter()
            .map(|e| (Coalition::Red, e))
            .chain(self.blue.iter().map(|e| (Coalition::Blue, e)))
    }
}

/// Page-structure knowledge for one site engine.
pub trait Extractor: Send + Sync {
    /// Engine tag this extractor serves.
    fn engine(&self) -> &'static str;

    /// Tour ids linked from a pilot page, in page order without duplicates.
    fn tour_ids(&self, doc: &Html, page_url: &Url) -> Result<Vec<i64>, ScrapeError>;

    /// URL of the sortie index of one tour, derived from the pilot page URL.
    fn sortie_index_url(&self, stats_page: &Url, tour_id: i64) -> Result<Url, ScrapeError>;

    /// Sortie detail links of an index page, in row order.
    fn sortie_refs(&self, doc: &Html, page_url: &Url) -> Vec<Url>;

    /// Rewrite a sortie reference to the page the record is read from.
    fn sortie_log_url(&self, reference: &Url) -> Result<Url, ScrapeError>;

    /// Read one sortie from its log page.
    fn sortie(&self, doc: &Html, log_url: &Url) -> Result<SortieRecord, ScrapeError>;

    /// URL of the server's online-players page.
    fn online_url(&self, server_url: &Url) -> Result<Url, ScrapeError>;

    /// Coalition sections of an online page. A missing section is reported
    /// in place and does not hide the others.
    fn roster_sections(&self, doc: &Html, page_url: &Url) -> Vec<Result<RosterSection, ScrapeError>>;
}

/// Look up the extractor for an engine tag.
pub fn extractor_for(engine: &str) -> Result<Box<dyn Extractor>, ScrapeError> {
    match engine {
        IL2STATS_ENGINE => Ok(Box::new(Il2Stats)),
        other => Err(ScrapeError::UnknownEngine(other.to_string())),
    }
}

/// Engine tags known to [`extractor_for`].
pub const ENGINES: &[&str] = &[IL2STATS_ENGINE];

/// Operations the import jobs need from a stats site.
#[allow(async_fn_in_trait)]
pub trait StatsSite {
    async fn discover_tours(&self, stats_page: &Url) -> Result<Vec<i64>, ScrapeError>;

    async fn list_sorties(&self, stats_page: &Url, tour_id: i64) -> Result<Vec<Url>, ScrapeError>;

    async fn scrape_sortie(&self, reference: &Url) -> Result<SortieRecord, ScrapeError>;

    async fn scrape_roster(&self, server_url: &Url) -> Result<Roster, ScrapeError>;
}

/// A stats site reached over HTTP.
pub struct Scraper {
    fetcher: Fetcher,
    extractor: Box<dyn Extractor>,
}

impl Scraper {
    pub fn new(fetcher: Fetcher, extractor: Box<dyn Extractor>) -> Self {
        Self { fetcher, extractor }
    }

    /// Scraper for a server's engine tag.
    pub fn for_engine(fetcher: Fetcher, engine: &str) -> Result<Self, ScrapeError> {
        Ok(Self::new(fetcher, extractor_for(engine)?))
    }
}

impl StatsSite for Scraper {
    async fn discover_tours(&self, stats_page: &Url) -> Result<Vec<i64>, ScrapeError> {
        let page = self.fetcher.fetch(stats_page).await?;
        self.extractor.tour_ids(&page.html, &page.url)
    }

    async fn list_sorties(&self, stats_page: &Url, tour_id: i64) -> Result<Vec<Url>, ScrapeError> {
        let url = self.extractor.sortie_index_url(stats_page, tour_id)?;
        tracing::debug!(engine = self.extractor.engine(), url = %url, "listing sorties");
        let page = self.fetcher.fetch(&url).await?;
        Ok(self.extractor.sortie_refs(&page.html, &page.url))
    }

    async fn scrape_sortie(&self, reference: &Url) -> Result<SortieRecord, ScrapeError> {
        let url = self.extractor.sortie_log_url(reference)?;
        let page = self.fetcher.fetch(&url).await?;
        self.extractor.sortie(&page.html, &url)
    }

    async fn scrape_roster(&self, server_url: &Url) -> Result<Roster, ScrapeError> {
        let url = self.extractor.online_url(server_url)?;
        let page = self.fetcher.fetch(&url).await?;

        let mut roster = Roster::default();
        for section in self.extractor.roster_sections(&page.html, &page.url) {
            match section {
                Ok(section) => roster.add_section(section),
                Err(e) => {
                    tracing::error!(engine = self.extractor.engine(), url = %url, error = %e, "skipping roster section");
                    roster.failed_sections.push(e.to_string());
                }
            }
        }
        Ok(roster)
    }
}
