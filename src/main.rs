//! squadstats - squad statistics collector for il2stats servers.
//!
//! Imports squad pilots' sorties into virtual lives and samples who is online
//! on each stats server.

mod config;
mod db;
mod reconcile;
mod scheduler;
mod scrape;

use config::Config;
use db::{Pilot, Points, Sortie, SomePilot, SomePilotName, Store, VirtualLife};
use scheduler::{ImportFilter, JobError};
use scrape::{Fetcher, ScrapeError, ENGINES};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "squadstats", version, about = "Collect squad statistics from il2stats servers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import sorties from the registered stats pages
    #[command(name = "import-sorties")]
    ImportSorties(ImportArgs),
    /// Record the players currently online
    #[command(name = "online-players")]
    OnlinePlayers(OnlineArgs),
    /// Run both jobs periodically until interrupted
    Watch,
    /// Players per coalition on a server at a point in time
    #[command(name = "roster-size")]
    RosterSize(RosterSizeArgs),
    /// Show a squad pilot's virtual lives and sorties
    Pilot(PilotArgs),
    /// Show an observed player and their name history
    Player(PlayerArgs),
    /// Register a stats server
    #[command(name = "add-server")]
    AddServer(AddServerArgs),
    /// Change a stats server's URL or engine
    #[command(name = "update-server")]
    UpdateServer(AddServerArgs),
    /// Remove a stats server and everything scraped from it
    #[command(name = "remove-server")]
    RemoveServer(RemoveServerArgs),
    /// Register a squad pilot
    #[command(name = "add-pilot")]
    AddPilot(AddPilotArgs),
    /// Set a pilot's stats page on a server
    #[command(name = "add-page")]
    AddPage(AddPageArgs),
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long, value_name = "USERNAME", conflicts_with = "server", help = "Only this squad pilot")]
    pilot: Option<String>,
    #[arg(long, value_name = "NAME", help = "Only this server")]
    server: Option<String>,
    #[arg(long, value_name = "ID", help = "Only this tour instead of every listed tour")]
    tour: Option<i64>,
}

#[derive(Debug, Args)]
struct OnlineArgs {
    #[arg(long, value_name = "NAME", help = "Only this server")]
    server: Option<String>,
}

#[derive(Debug, Args)]
struct RosterSizeArgs {
    #[arg(long, value_name = "NAME")]
    server: String,
    #[arg(long, value_name = "RFC3339", help = "Point in time (default: now)")]
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Args)]
struct PilotArgs {
    username: String,
}

#[derive(Debug, Args)]
struct PlayerArgs {
    /// Player id on the stats site
    site_id: i64,
}

#[derive(Debug, Args)]
struct AddServerArgs {
    name: String,
    url: String,
    #[arg(long, value_name = "TAG", help = "Scraper engine (default: il2stats)")]
    engine: Option<String>,
}

#[derive(Debug, Args)]
struct RemoveServerArgs {
    name: String,
}

#[derive(Debug, Args)]
struct AddPilotArgs {
    username: String,
}

#[derive(Debug, Args)]
struct AddPageArgs {
    username: String,
    server: String,
    url: String,
}

#[derive(Serialize)]
struct RosterSizeReport {
    server: String,
    at: DateTime<Utc>,
    red: i64,
    blue: i64,
    total: i64,
    closest_sample: Option<DateTime<Utc>>,
    samples: i64,
}

#[derive(Serialize)]
struct SortieView {
    #[serde(flatten)]
    sortie: Sortie,
    aircraft: String,
}

#[derive(Serialize)]
struct LifeView {
    #[serde(flatten)]
    life: VirtualLife,
    total_points: Points,
    sorties: Vec<SortieView>,
}

#[derive(Serialize)]
struct PilotReport {
    pilot: Pilot,
    open_life: Option<i64>,
    lives: Vec<LifeView>,
}

#[derive(Serialize)]
struct PlayerReport {
    player: SomePilot,
    current_name: Option<SomePilotName>,
    names: Vec<SomePilotName>,
}

/// Lives oldest first, each with its sorties and aircraft names.
fn pilot_report(store: &Store, pilot: Pilot) -> Result<PilotReport, BoxError> {
    let aircraft: HashMap<i64, String> = store.get_aircraft()?.into_iter().map(|a| (a.id, a.name)).collect();
    let mut sorties = store.get_pilot_sorties(pilot.id)?;
    let open_life = store.get_open_life(pilot.id)?.map(|life| life.number);

    let mut lives = Vec::new();
    for life in store.get_lives(pilot.id)?.into_iter().rev() {
        let (own, rest): (Vec<_>, Vec<_>) = sorties.into_iter().partition(|s| s.virtual_life_id == life.id);
        sorties = rest;
        lives.push(LifeView {
            total_points: life.points.total(),
            sorties: own
                .into_iter()
                .map(|sortie| SortieView {
                    aircraft: aircraft.get(&sortie.aircraft_id).cloned().unwrap_or_default(),
                    sortie,
                })
                .collect(),
            life,
        });
    }
    Ok(PilotReport { pilot, open_life, lives })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), BoxError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("squadstats=info".parse()?))
        .init();

    let cli = Cli::parse();
    let cfg = Config::load();
    tracing::debug!(db = %cfg.db_path, timeout = ?cfg.request_timeout, "configuration loaded");

    let store = Store::new(&cfg.db_path)?;
    let fetcher = Fetcher::new(cfg.request_timeout, &cfg.user_agent)?;

    match cli.command {
        Commands::ImportSorties(args) => {
            let filter = ImportFilter {
                pilot: args.pilot,
                server: args.server,
                tour: args.tour,
            };
            let summary = scheduler::import_sorties(&store, &fetcher, &filter).await?;
            print_json(&summary)?;
        }
        Commands::OnlinePlayers(args) => {
            let summary = scheduler::poll_online(&store, &fetcher, args.server.as_deref()).await?;
            print_json(&summary)?;
        }
        Commands::Watch => scheduler::watch(&store, &fetcher, &cfg).await,
        Commands::RosterSize(args) => {
            let server = store
                .get_server_by_name(&args.server)?
                .ok_or_else(|| JobError::UnknownServer(args.server.clone()))?;
            let at = args.at.unwrap_or_else(Utc::now);
            let size = store.roster_size_at(server.id, at)?;
            print_json(&RosterSizeReport {
                server: server.name,
                at,
                red: size.red,
                blue: size.blue,
                total: size.total(),
                closest_sample: store.closest_sample_time(server.id, at)?,
                samples: store.count_occurrences(server.id)?,
            })?;
        }
        Commands::Pilot(args) => {
            let pilot = store
                .get_pilot_by_username(&args.username)?
                .ok_or_else(|| JobError::UnknownPilot(args.username.clone()))?;
            print_json(&pilot_report(&store, pilot)?)?;
        }
        Commands::Player(args) => {
            let player = store
                .get_some_pilot(args.site_id)?
                .ok_or(JobError::UnknownPlayer(args.site_id))?;
            print_json(&PlayerReport {
                current_name: store.current_name(player.id)?,
                names: store.get_names(player.id)?,
                player,
            })?;
        }
        Commands::AddServer(args) => {
            if let Some(engine) = args.engine.as_deref() {
                if !ENGINES.contains(&engine) {
                    return Err(ScrapeError::UnknownEngine(engine.to_string()).into());
                }
            }
            let server = store.add_server(&args.name, &args.url, args.engine.as_deref())?;
            tracing::info!(server = %server.name, url = %server.url, "server added");
            print_json(&server)?;
        }
        Commands::UpdateServer(args) => {
            let mut server = store
                .get_server_by_name(&args.name)?
                .ok_or_else(|| JobError::UnknownServer(args.name.clone()))?;
            if let Some(engine) = args.engine {
                if !ENGINES.contains(&engine.as_str()) {
                    return Err(ScrapeError::UnknownEngine(engine).into());
                }
                server.engine = engine;
            }
            server.url = args.url;
            let server = store.update_server(&server)?;
            tracing::info!(server = %server.name, url = %server.url, engine = %server.engine, "server updated");
            print_json(&server)?;
        }
        Commands::RemoveServer(args) => {
            let server = store
                .get_server_by_name(&args.name)?
                .ok_or_else(|| JobError::UnknownServer(args.name.clone()))?;
            store.delete_server(server.id)?;
            tracing::info!(server = %server.name, "server removed");
        }
        Commands::AddPilot(args) => {
            let pilot = store.add_pilot(&args.username)?;
            tracing::info!(pilot = %pilot.username, "pilot added");
            print_json(&pilot)?;
        }
        Commands::AddPage(args) => {
            let pilot = store
                .get_pilot_by_username(&args.username)?
                .ok_or_else(|| JobError::UnknownPilot(args.username.clone()))?;
            let server = store
                .get_server_by_name(&args.server)?
                .ok_or_else(|| JobError::UnknownServer(args.server.clone()))?;
            let page = store.set_stats_page(pilot.id, server.id, &args.url)?;
            tracing::info!(pilot = %pilot.username, server = %server.name, url = %page.url, "stats page set");
            print_json(&page)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::temp_store;
    use crate::reconcile::reconcile_sortie;
    use crate::scrape::{PilotStatus, SortieRecord};
    use chrono::{Duration, TimeZone};

    fn record(sortie_id: i64, day: i64, status: PilotStatus) -> SortieRecord {
        let start = Utc.with_ymd_and_hms(2024, 3, 12, 18, 0, 0).unwrap() + Duration::days(day);
        SortieRecord {
            sortie_id,
            tour_id: 7,
            aircraft: format!("Yak-1 ser.{}", sortie_id),
            start_at: start,
            end_at: start + Duration::minutes(40),
            air_kills: 1,
            ground_kills: 0,
            ship_kills: 0,
            status,
            points: db::PointTotals {
                sortie: Points(1000),
                air_combat: Points(250),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_pilot_report_groups_sorties_by_life() {
        let (_tmp, store) = temp_store();
        let pilot = store.add_pilot("Ace").unwrap();
        reconcile_sortie(&store, &pilot, &record(1, 0, PilotStatus::Killed)).unwrap();
        reconcile_sortie(&store, &pilot, &record(2, 1, PilotStatus::Alive)).unwrap();
        reconcile_sortie(&store, &pilot, &record(3, 2, PilotStatus::Alive)).unwrap();

        let report = pilot_report(&store, pilot).unwrap();
        assert_eq!(report.open_life, Some(2));
        assert_eq!(report.lives.len(), 2);

        let first = &report.lives[0];
        assert_eq!(first.life.number, 1);
        assert_eq!(first.total_points, Points(1250));
        assert_eq!(first.sorties.len(), 1);
        assert_eq!(first.sorties[0].aircraft, "Yak-1 ser.1");

        let second = &report.lives[1];
        assert_eq!(second.total_points, Points(2500));
        let ids: Vec<i64> = second.sorties.iter().map(|s| s.sortie.sortie_id).collect();
        assert_eq!(ids, vec![2, 3]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["lives"][1]["sorties"][0]["aircraft"], "Yak-1 ser.2");
        assert_eq!(json["lives"][0]["total_points"], 12.5);
    }
}
