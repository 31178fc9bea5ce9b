//! Channel names of the realtime API.
//!
//! Names follow `<base>[_schematic][_<tenant>][_<id>][_gen<level>]`. Vehicle
//! ids already carry their tenant (`sbb_140494499865208`), so the tenant
//! part is written through the id.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Trajectories in the viewport.
pub const TRAJECTORY: &str = "trajectory";
/// Vehicles that left the viewport or stopped reporting.
pub const DELETED_VEHICLES: &str = "deleted_vehicles";
/// Full route geometry of one vehicle.
pub const FULL_TRAJECTORY: &str = "full_trajectory";
/// Stop sequence of one vehicle.
pub const STOP_SEQUENCE: &str = "stopsequence";
/// Stations in the viewport.
pub const STATION: &str = "station";
/// Departures of one station.
pub const TIMETABLE: &str = "timetable";
/// Service disruptions.
pub const NEWSTICKER: &str = "newsticker";
/// Additional map geometries.
pub const EXTRA_GEOMS: &str = "extra_geoms";
/// Server health.
pub const HEALTHCHECK: &str = "healthcheck";

/// Which geometry flavour the server serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeMode {
    /// Real-world geometries.
    #[default]
    Topographic,
    /// Schematic network-plan geometries.
    Schematic,
}

impl RealtimeMode {
    /// Both modes.
    pub const ALL: [Self; 2] = [Self::Topographic, Self::Schematic];

    /// Channel name suffix of this mode.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Topographic => "",
            Self::Schematic => "_schematic",
        }
    }
}

impl std::fmt::Display for RealtimeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Topographic => f.write_str("topographic"),
            Self::Schematic => f.write_str("schematic"),
        }
    }
}

impl FromStr for RealtimeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "topographic" => Ok(Self::Topographic),
            "schematic" => Ok(Self::Schematic),
            other => Err(format!("unknown realtime mode: {other}")),
        }
    }
}

/// Simplification level of full trajectories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generalization {
    /// `gen5`
    Gen5,
    /// `gen10`
    Gen10,
    /// `gen30`
    Gen30,
    /// `gen100`
    Gen100,
}

impl Generalization {
    /// Every level, finest first.
    pub const ALL: [Self; 4] = [Self::Gen5, Self::Gen10, Self::Gen30, Self::Gen100];

    /// Numeric level as used on the wire.
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Self::Gen5 => 5,
            Self::Gen10 => 10,
            Self::Gen30 => 30,
            Self::Gen100 => 100,
        }
    }

    /// Parse a numeric level.
    #[must_use]
    pub fn from_level(level: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.level() == level)
    }
}

/// Builder for a channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelName {
    base: &'static str,
    mode: RealtimeMode,
    id: Option<String>,
    generalization: Option<Generalization>,
}

impl ChannelName {
    /// Start from a base name such as [`TRAJECTORY`].
    #[must_use]
    pub fn new(base: &'static str) -> Self {
        Self {
            base,
            mode: RealtimeMode::Topographic,
            id: None,
            generalization: None,
        }
    }

    /// Set the mode suffix.
    #[must_use]
    pub fn mode(mut self, mode: RealtimeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the id part.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into()).filter(|i: &String| !i.is_empty());
        self
    }

    /// Request a generalization level. Ignored in schematic mode.
    #[must_use]
    pub fn generalization(mut self, generalization: Option<Generalization>) -> Self {
        self.generalization = generalization;
        self
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.base, self.mode.suffix())?;
        if let Some(id) = &self.id {
            write!(f, "_{id}")?;
        }
        if let (RealtimeMode::Topographic, Some(generalization)) =
            (self.mode, self.generalization)
        {
            write!(f, "_gen{}", generalization.level())?;
        }
        Ok(())
    }
}

/// `trajectory[_schematic]`
#[must_use]
pub fn trajectory(mode: RealtimeMode) -> String {
    ChannelName::new(TRAJECTORY).mode(mode).to_string()
}

/// `deleted_vehicles[_schematic]`
#[must_use]
pub fn deleted_vehicles(mode: RealtimeMode) -> String {
    ChannelName::new(DELETED_VEHICLES).mode(mode).to_string()
}

/// `full_trajectory[_schematic]_<id>[_gen<level>]`
#[must_use]
pub fn full_trajectory(
    id: &str,
    mode: RealtimeMode,
    generalization: Option<Generalization>,
) -> String {
    ChannelName::new(FULL_TRAJECTORY)
        .mode(mode)
        .id(id)
        .generalization(generalization)
        .to_string()
}

/// Every name a full trajectory of `id` may be served under.
#[must_use]
pub fn full_trajectory_variants(id: &str) -> Vec<String> {
    let mut names: Vec<String> = RealtimeMode::ALL
        .into_iter()
        .map(|mode| full_trajectory(id, mode, None))
        .collect();
    names.extend(
        Generalization::ALL
            .into_iter()
            .map(|g| full_trajectory(id, RealtimeMode::Topographic, Some(g))),
    );
    names
}

/// `stopsequence_<id>`
#[must_use]
pub fn stop_sequence(id: &str) -> String {
    ChannelName::new(STOP_SEQUENCE).id(id).to_string()
}

/// `station[_schematic]`
#[must_use]
pub fn station(mode: RealtimeMode) -> String {
    ChannelName::new(STATION).mode(mode).to_string()
}

/// `timetable_<station id>`
#[must_use]
pub fn timetable(station_id: &str) -> String {
    ChannelName::new(TIMETABLE).id(station_id).to_string()
}
