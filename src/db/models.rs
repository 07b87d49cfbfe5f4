//! Database model types.

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;

/// A remote stats installation.
#[derive(Debug, Clone, Serialize)]
pub struct StatsServer {
    pub id: i64,
    pub name: String,
    /// Base URL (scheme, host and port only).
    pub url: String,
    /// Scraper engine tag selecting the extraction strategy.
    pub engine: String,
}

/// A locally registered squad pilot.
#[derive(Debug, Clone, Serialize)]
pub struct Pilot {
    pub id: i64,
    pub username: String,
}

/// A pilot's stats page on one server.
#[derive(Debug, Clone, Serialize)]
pub struct PilotStatsPage {
    pub id: i64,
    pub pilot_id: i64,
    pub server_id: i64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Aircraft {
    pub id: i64,
    pub name: String,
}

/// A fixed two-decimal point value, stored as hundredths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "f64")]
pub struct Points(pub i64);

impl Points {
    pub fn hundredths(self) -> i64 {
        self.0
    }
}

impl From<Points> for f64 {
    fn from(p: Points) -> f64 {
        p.0 as f64 / 100.0
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Error returned when a point value cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPoints(pub String);

impl fmt::Display for InvalidPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid point value: {:?}", self.0)
    }
}

impl std::error::Error for InvalidPoints {}

impl FromStr for Points {
    type Err = InvalidPoints;

    /// Parses non-negative decimals such as `12`, `12.5` or `1,234.56`.
    /// Digits past the second decimal are truncated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"^(?P<int>\d+)(?:\.(?P<frac>\d*))?$").unwrap());

        let cleaned: String = s.chars().filter(|c| !c.is_whitespace() && *c != ',').collect();
        let caps = re
            .captures(&cleaned)
            .ok_or_else(|| InvalidPoints(s.to_string()))?;

        let int: i64 = caps["int"]
            .parse()
            .map_err(|_| InvalidPoints(s.to_string()))?;
        let frac = caps.name("frac").map(|m| m.as_str()).unwrap_or("");
        let mut digits = frac.chars().take(2).collect::<String>();
        while digits.len() < 2 {
            digits.push('0');
        }
        let frac: i64 = digits.parse().map_err(|_| InvalidPoints(s.to_string()))?;

        int.checked_mul(100)
            .and_then(|v| v.checked_add(frac))
            .map(Points)
            .ok_or_else(|| InvalidPoints(s.to_string()))
    }
}

impl Add for Points {
    type Output = Points;
    fn add(self, rhs: Points) -> Points {
        Points(self.0 + rhs.0)
    }
}

impl Sub for Points {
    type Output = Points;
    fn sub(self, rhs: Points) -> Points {
        Points(self.0 - rhs.0)
    }
}

/// The six point categories tracked per sortie and per virtual life.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PointTotals {
    /// Points for the sortie itself, depending on its length.
    pub sortie: Points,
    pub air_combat: Points,
    pub ground_combat: Points,
    pub ship_combat: Points,
    pub leadership: Points,
    /// Points for NCO duties, e.g. supporting the flight leader.
    pub nco: Points,
}

impl PointTotals {
    pub fn total(&self) -> Points {
        self.sortie + self.air_combat + self.ground_combat + self.ship_combat + self.leadership + self.nco
    }
}

impl Add for PointTotals {
    type Output = PointTotals;
    fn add(self, rhs: PointTotals) -> PointTotals {
        PointTotals {
            sortie: self.sortie + rhs.sortie,
            air_combat: self.air_combat + rhs.air_combat,
            ground_combat: self.ground_combat + rhs.ground_combat,
            ship_combat: self.ship_combat + rhs.ship_combat,
            leadership: self.leadership + rhs.leadership,
            nco: self.nco + rhs.nco,
        }
    }
}

impl Sub for PointTotals {
    type Output = PointTotals;
    fn sub(self, rhs: PointTotals) -> PointTotals {
        PointTotals {
            sortie: self.sortie - rhs.sortie,
            air_combat: self.air_combat - rhs.air_combat,
            ground_combat: self.ground_combat - rhs.ground_combat,
            ship_combat: self.ship_combat - rhs.ship_combat,
            leadership: self.leadership - rhs.leadership,
            nco: self.nco - rhs.nco,
        }
    }
}

/// What one sortie adds to its virtual life's running totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Contribution {
    pub flight_time: i64,
    pub air_kills: i64,
    pub ground_kills: i64,
    pub ship_kills: i64,
    pub points: PointTotals,
}

impl Add for Contribution {
    type Output = Contribution;
    fn add(self, rhs: Contribution) -> Contribution {
        Contribution {
            flight_time: self.flight_time + rhs.flight_time,
            air_kills: self.air_kills + rhs.air_kills,
            ground_kills: self.ground_kills + rhs.ground_kills,
            ship_kills: self.ship_kills + rhs.ship_kills,
            points: self.points + rhs.points,
        }
    }
}

impl Sub for Contribution {
    type Output = Contribution;
    fn sub(self, rhs: Contribution) -> Contribution {
        Contribution {
            flight_time: self.flight_time - rhs.flight_time,
            air_kills: self.air_kills - rhs.air_kills,
            ground_kills: self.ground_kills - rhs.ground_kills,
            ship_kills: self.ship_kills - rhs.ship_kills,
            points: self.points - rhs.points,
        }
    }
}

/// A pilot's continuous in-game life.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VirtualLife {
    pub id: i64,
    pub pilot_id: i64,
    pub number: i64,
    pub start_date: NaiveDate,
    /// `None` while the life is open.
    pub end_date: Option<NaiveDate>,
    /// Accumulated flight time in seconds.
    pub flight_time: i64,
    pub was_wounded: bool,
    pub air_kills: i64,
    pub ground_kills: i64,
    pub ship_kills: i64,
    pub points: PointTotals,
}

impl VirtualLife {
    pub fn is_open(&self) -> bool {
        self.end_date.is_none()
    }
}

/// One flown mission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sortie {
    pub id: i64,
    pub virtual_life_id: i64,
    pub aircraft_id: i64,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub was_wounded: bool,
    pub air_kills: i64,
    pub ground_kills: i64,
    pub ship_kills: i64,
    pub points: PointTotals,
    /// Remote tour the sortie belongs to.
    pub tour_id: i64,
    /// Remote sortie identifier, unique across the store.
    pub sortie_id: i64,
}

impl Sortie {
    pub fn contribution(&self) -> Contribution {
        Contribution {
            flight_time: (self.end_at - self.start_at).num_seconds(),
            air_kills: self.air_kills,
            ground_kills: self.ground_kills,
            ship_kills: self.ship_kills,
            points: self.points,
        }
    }
}

/// One of the two opposing factions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Coalition {
    Red,
    Blue,
}

impl Coalition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coalition::Red => "red",
            Coalition::Blue => "blue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "red" => Some(Coalition::Red),
            "blue" => Some(Coalition::Blue),
            _ => None,
        }
    }
}

impl fmt::Display for Coalition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A player as seen on a server's online page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SomePilot {
    pub id: i64,
    pub server_id: i64,
    /// Player id on the remote site; survives name changes.
    pub site_id: i64,
    pub red_count: i64,
    pub blue_count: i64,
    pub squad_pilot_id: Option<i64>,
}

/// A display name a player has used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SomePilotName {
    pub id: i64,
    pub some_pilot_id: i64,
    pub name: String,
    /// Player page URL; it embeds the name, so it is tracked per name.
    pub url: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_current: bool,
}

/// A single timestamped roster sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerOccurrence {
    pub id: i64,
    pub server_id: i64,
    pub some_pilot_id: i64,
    pub coalition: Coalition,
    pub timestamp: DateTime<Utc>,
}

/// Roster size at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RosterSize {
    pub red: i64,
    pub blue: i64,
}

impl RosterSize {
    pub fn total(&self) -> i64 {
        self.red + self.blue
    }
}
