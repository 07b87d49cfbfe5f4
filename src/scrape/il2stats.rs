//! Extractor for il2stats installations (English locale).
//!
//! Page shapes handled here:
//! - pilot page: tour links in `#nav_main div.nav_tour_items a`, `href="?tour=<id>"`
//! - sortie index: `/<lang>/sorties/<pilot>/...?tour=<id>`, rows `div.sorties_list a.row`
//! - sortie log: `/en/sortie/log/<id>/?tour=<id>`, label/value rows in `div.sortie_info`
//! - online page: `/en/online`, two `div.online_coal_N` blocks with a header and rows

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

use super::{Extractor, PilotStatus, RosterEntry, RosterSection, ScrapeError, SortieRecord};
use crate::db::{Coalition, PointTotals, Points};

pub const IL2STATS_ENGINE: &str = "il2stats";

/// Header text marking the red coalition block.
const ALLIES_LABEL: &str = "allies";

const COALITION_SECTIONS: [&str; 2] = [
    "div.online_players div.online_coal_1",
    "div.online_players div.online_coal_2",
];

const DATE_FORMATS: [&str; 2] = ["%d.%m.%Y %H:%M:%S", "%d.%m.%Y %H:%M"];

// Sortie log labels, English layout only.
const LABEL_AIRCRAFT: &str = "Aircraft";
const LABEL_START: &str = "Sortie start";
const LABEL_END: &str = "Sortie end";
const LABEL_AIR_KILLS: &str = "Aircraft destroyed";
const LABEL_GROUND_KILLS: &str = "Ground targets destroyed";
const LABEL_SHIP_KILLS: &str = "Ships destroyed";
const LABEL_STATUS: &str = "Status";
const LABEL_SORTIE_POINTS: &str = "Sortie points";
const LABEL_AIR_POINTS: &str = "Air combat points";
const LABEL_GROUND_POINTS: &str = "Ground combat points";
const LABEL_SHIP_POINTS: &str = "Ship combat points";
const LABEL_LEADERSHIP_POINTS: &str = "Leadership points";
const LABEL_NCO_POINTS: &str = "NCO points";

fn selector(cell: &'static OnceLock<Selector>, css: &str) -> &'static Selector {
    cell.get_or_init(|| Selector::parse(css).unwrap())
}

/// Element text with whitespace collapsed.
fn text_of(el: &ElementRef) -> String {
    el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

fn normalize_label(label: &str) -> String {
    label.trim().trim_end_matches(':').trim().to_lowercase()
}

/// Replace the locale segment of a path with `en`, adding one if absent.
fn force_english(segments: &mut Vec<String>) {
    let is_locale = |s: &str| {
        let base = s.split(['-', '_']).next().unwrap_or("");
        base.len() == 2 && base.chars().all(|c| c.is_ascii_alphabetic())
    };
    match segments.first() {
        Some(first) if is_locale(first) => segments[0] = "en".to_string(),
        _ => segments.insert(0, "en".to_string()),
    }
}

fn path_segments(url: &Url) -> Vec<String> {
    url.path()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Rebuild a path from segments, keeping a trailing slash if the original had one.
fn set_segments(url: &mut Url, segments: &[String], trailing_slash: bool) {
    let mut path = format!("/{}", segments.join("/"));
    if trailing_slash && !path.ends_with('/') {
        path.push('/');
    }
    url.set_path(&path);
}

/// The last path segment that is a plain integer.
fn last_numeric_segment(url: &Url) -> Option<i64> {
    path_segments(url).iter().rev().find_map(|s| s.parse().ok())
}

fn parse_page_time(field: &str, value: &str) -> Result<DateTime<Utc>, ScrapeError> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
        .ok_or_else(|| ScrapeError::parse(field, format!("unrecognized date {:?}", value)))
}

fn parse_count(field: &str, value: &str) -> Result<i64, ScrapeError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\s*(\d+)").unwrap());
    re.captures(value)
        .and_then(|c| c[1].parse().ok())
        .ok_or_else(|| ScrapeError::parse(field, format!("not a count: {:?}", value)))
}

fn parse_points(field: &str, value: &str) -> Result<Points, ScrapeError> {
    value
        .parse::<Points>()
        .map_err(|e| ScrapeError::parse(field, e.to_string()))
}

fn parse_status(value: &str) -> Result<PilotStatus, ScrapeError> {
    let lower = value.to_lowercase();
    if lower.contains("killed") || lower.contains("dead") {
        Ok(PilotStatus::Killed)
    } else if lower.contains("captured") {
        Ok(PilotStatus::Captured)
    } else if lower.contains("wounded") {
        Ok(PilotStatus::Wounded)
    } else if lower.contains("alive") || lower.contains("healthy") {
        Ok(PilotStatus::Alive)
    } else {
        Err(ScrapeError::parse(LABEL_STATUS, format!("unknown status {:?}", value)))
    }
}

/// Label/value pairs of a sortie log page.
struct InfoTable {
    rows: Vec<(String, String)>,
}

impl InfoTable {
    fn read(doc: &Html) -> Self {
        static ROWS: OnceLock<Selector> = OnceLock::new();
        static CELLS: OnceLock<Selector> = OnceLock::new();
        let rows_sel = selector(&ROWS, "div.sortie_info div.row");
        let cells_sel = selector(&CELLS, "div.cell");

        let rows = doc
            .select(rows_sel)
            .filter_map(|row| {
                let cells: Vec<_> = row.select(cells_sel).collect();
                match cells.as_slice() {
                    [label, .., value] => Some((normalize_label(&text_of(label)), text_of(value))),
                    _ => None,
                }
            })
            .collect();
        Self { rows }
    }

    fn get(&self, label: &str) -> Result<&str, ScrapeError> {
        let wanted = normalize_label(label);
        self.rows
            .iter()
            .find(|(l, _)| *l == wanted)
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| ScrapeError::parse(label, "field not found"))
    }
}

/// The il2stats page family.
pub struct Il2Stats;

impl Extractor for Il2Stats {
    fn engine(&self) -> &'static str {
        IL2STATS_ENGINE
    }

    fn tour_ids(&self, doc: &Html, page_url: &Url) -> Result<Vec<i64>, ScrapeError> {
        static TOUR_LINKS: OnceLock<Selector> = OnceLock::new();
        let links = selector(&TOUR_LINKS, "#nav_main div.nav_tour_items a");

        let mut tours = Vec::new();
        for link in doc.select(links) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            match href.rsplit('=').next().and_then(|id| id.trim().parse::<i64>().ok()) {
                Some(id) if !tours.contains(&id) => tours.push(id),
                Some(_) => {}
                None => tracing::debug!(href, "ignoring tour link without id"),
            }
        }

        if tours.is_empty() {
            return Err(ScrapeError::NoTours {
                url: page_url.to_string(),
            });
        }
        Ok(tours)
    }

    fn sortie_index_url(&self, stats_page: &Url, tour_id: i64) -> Result<Url, ScrapeError> {
        let mut segments = path_segments(stats_page);
        let pos = segments
            .iter()
            .position(|s| s == "pilot")
            .ok_or_else(|| ScrapeError::InvalidUrl {
                url: stats_page.to_string(),
                reason: "no pilot segment in path".to_string(),
            })?;
        segments[pos] = "sorties".to_string();

        let mut url = stats_page.clone();
        set_segments(&mut url, &segments, stats_page.path().ends_with('/'));
        url.set_fragment(None);
        url.set_query(Some(&format!("tour={}", tour_id)));
        Ok(url)
    }

    fn sortie_refs(&self, doc: &Html, page_url: &Url) -> Vec<Url> {
        static ROWS: OnceLock<Selector> = OnceLock::new();
        static FALLBACK: OnceLock<Selector> = OnceLock::new();
        let rows = selector(&ROWS, "div.sorties_list a.row");
        let fallback = selector(&FALLBACK, r#"a.row[href*="/sortie/"]"#);

        let mut links: Vec<_> = doc.select(rows).collect();
        if links.is_empty() {
            links = doc.select(fallback).collect();
        }

        links
            .iter()
            .filter_map(|row| {
                let href = row.value().attr("href")?;
                match page_url.join(href) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::warn!(href, error = %e, "skipping sortie row with bad link");
                        None
                    }
                }
            })
            .collect()
    }

    fn sortie_log_url(&self, reference: &Url) -> Result<Url, ScrapeError> {
        let mut segments = path_segments(reference);
        let pos = segments
            .iter()
            .position(|s| s == "sortie")
            .ok_or_else(|| ScrapeError::InvalidUrl {
                url: reference.to_string(),
                reason: "no sortie segment in path".to_string(),
            })?;
        if segments.get(pos + 1).map(String::as_str) != Some("log") {
            segments.insert(pos + 1, "log".to_string());
        }
        force_english(&mut segments);

        let mut url = reference.clone();
        set_segments(&mut url, &segments, true);
        url.set_fragment(None);
        Ok(url)
    }

    fn sortie(&self, doc: &Html, log_url: &Url) -> Result<SortieRecord, ScrapeError> {
        let segments = path_segments(log_url);
        let sortie_id = segments
            .iter()
            .position(|s| s == "log")
            .and_then(|pos| segments.get(pos + 1))
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| ScrapeError::parse("sortie_id", format!("no sortie id in {}", log_url)))?;

        let tour_id = match log_url.query_pairs().find(|(k, _)| k == "tour") {
            Some((_, v)) => v
                .parse::<i64>()
                .map_err(|_| ScrapeError::parse("tour_id", format!("bad tour parameter {:?}", v)))?,
            None => 0,
        };

        let info = InfoTable::read(doc);

        let aircraft = info.get(LABEL_AIRCRAFT)?.to_string();
        if aircraft.is_empty() {
            return Err(ScrapeError::parse(LABEL_AIRCRAFT, "empty aircraft name"));
        }
        let start_at = parse_page_time(LABEL_START, info.get(LABEL_START)?)?;
        let end_at = parse_page_time(LABEL_END, info.get(LABEL_END)?)?;
        if end_at < start_at {
            return Err(ScrapeError::parse(LABEL_END, "sortie ends before it starts"));
        }

        let count = |label: &str| info.get(label).and_then(|v| parse_count(label, v));
        let points = |label: &str| info.get(label).and_then(|v| parse_points(label, v));

        Ok(SortieRecord {
            sortie_id,
            tour_id,
            aircraft,
            start_at,
            end_at,
            air_kills: count(LABEL_AIR_KILLS)?,
            ground_kills: count(LABEL_GROUND_KILLS)?,
            ship_kills: count(LABEL_SHIP_KILLS)?,
            status: parse_status(info.get(LABEL_STATUS)?)?,
            points: PointTotals {
                sortie: points(LABEL_SORTIE_POINTS)?,
                air_combat: points(LABEL_AIR_POINTS)?,
                ground_combat: points(LABEL_GROUND_POINTS)?,
                ship_combat: points(LABEL_SHIP_POINTS)?,
                leadership: points(LABEL_LEADERSHIP_POINTS)?,
                nco: points(LABEL_NCO_POINTS)?,
            },
        })
    }

    fn online_url(&self, server_url: &Url) -> Result<Url, ScrapeError> {
        server_url
            .join("/en/online")
            .map_err(|e| ScrapeError::InvalidUrl {
                url: server_url.to_string(),
                reason: e.to_string(),
            })
    }

    fn roster_sections(&self, doc: &Html, page_url: &Url) -> Vec<Result<RosterSection, ScrapeError>> {
        static SECTIONS: [OnceLock<Selector>; 2] = [OnceLock::new(), OnceLock::new()];
        static HEADER: OnceLock<Selector> = OnceLock::new();
        static ROWS: OnceLock<Selector> = OnceLock::new();
        static CELL: OnceLock<Selector> = OnceLock::new();
        let header_sel = selector(&HEADER, "div.header");
        let rows_sel = selector(&ROWS, "div.content_table > a.row");
        let cell_sel = selector(&CELL, "div.cell");

        COALITION_SECTIONS
            .iter()
            .zip(SECTIONS.iter())
            .map(|(css, cell)| -> Result<RosterSection, ScrapeError> {
                let root = doc
                    .select(selector(cell, css))
                    .next()
                    .ok_or_else(|| ScrapeError::SectionNotFound {
                        selector: css.to_string(),
                    })?;

                let header = root
                    .select(header_sel)
                    .next()
                    .map(|h| text_of(&h))
                    .ok_or_else(|| ScrapeError::parse("coalition header", format!("missing in {}", css)))?;
                let coalition = if header.to_lowercase().contains(ALLIES_LABEL) {
                    Coalition::Red
                } else {
                    Coalition::Blue
                };

                let entries = root
                    .select(rows_sel)
                    .filter_map(|row| {
                        let href = row.value().attr("href")?;
                        let url = page_url.join(href).ok()?;
                        let Some(site_id) = last_numeric_segment(&url) else {
                            tracing::warn!(href, "skipping player row without id");
                            return None;
                        };
                        let name = row.select(cell_sel).next().map(|c| text_of(&c)).unwrap_or_default();
                        if name.is_empty() {
                            tracing::warn!(href, "skipping player row without name");
                            return None;
                        }
                        tracing::debug!(site_id, name = %name, coalition = %coalition, "player online");
                        Some(RosterEntry {
                            site_id,
                            name,
                            url: url.to_string(),
                        })
                    })
                    .collect();

                Ok(RosterSection { coalition, entries })
            })
            .collect()
    }
}
