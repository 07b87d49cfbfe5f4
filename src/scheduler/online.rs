//! Online roster job.

use chrono::Utc;
use reqwest::Url;
use serde::Serialize;

use super::JobError;
use crate::db::{StatsServer, Store};
use crate::reconcile::record_sighting;
use crate::scrape::{Fetcher, ScrapeError, Scraper, StatsSite};

/// Counters reported by one roster run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OnlineSummary {
    pub servers: usize,
    pub sightings: usize,
    pub failed_sections: usize,
    pub failed_servers: usize,
}

/// Servers to poll: the named one, or all of them.
pub fn select_servers(store: &Store, server: Option<&str>) -> Result<Vec<StatsServer>, JobError> {
    match server {
        Some(name) => {
            let server = store
                .get_server_by_name(name)?
                .ok_or_else(|| JobError::UnknownServer(name.to_string()))?;
            Ok(vec![server])
        }
        None => Ok(store.get_servers()?),
    }
}

/// Record who is online on each selected server.
pub async fn poll_online(store: &Store, fetcher: &Fetcher, server: Option<&str>) -> Result<OnlineSummary, JobError> {
    let servers = select_servers(store, server)?;
    tracing::info!(servers = servers.len(), "polling online players");

    let mut summary = OnlineSummary::default();
    for server in &servers {
        summary.servers += 1;
        let site = match Scraper::for_engine(fetcher.clone(), &server.engine) {
            Ok(site) => site,
            Err(e) => {
                tracing::error!(server = %server.name, error = %e, "cannot scrape server");
                summary.failed_servers += 1;
                continue;
            }
        };
        if let Err(e) = poll_server(store, &site, server, &mut summary).await {
            tracing::error!(server = %server.name, transient = e.is_transient(), error = %e, "roster poll failed");
            summary.failed_servers += 1;
        }
    }

    tracing::info!(?summary, "online poll finished");
    Ok(summary)
}

/// Scrape one server's roster and record every sighting with one timestamp.
pub async fn poll_server<S: StatsSite>(
    store: &Store,
    site: &S,
    server: &StatsServer,
    summary: &mut OnlineSummary,
) -> Result<(), ScrapeError> {
    let url = Url::parse(&server.url).map_err(|e| ScrapeError::InvalidUrl {
        url: server.url.clone(),
        reason: e.to_string(),
    })?;
    let roster = site.scrape_roster(&url).await?;
    summary.failed_sections += roster.failed_sections.len();

    let now = Utc::now();
    for (coalition, entry) in roster.sightings() {
        match record_sighting(store, server, entry, coalition, now) {
            Ok(_) => summary.sightings += 1,
            Err(e) => tracing::error!(
                server = %server.name,
                site_id = entry.site_id,
                name = %entry.name,
                error = %e,
                "could not record sighting"
            ),
        }
    }
    tracing::info!(
        server = %server.name,
        red = roster.red.len(),
        blue = roster.blue.len(),
        "recorded roster"
    );
    Ok(())
}
