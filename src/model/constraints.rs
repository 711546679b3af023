//! Environment constraints and the process-wide snapshot they are checked against.
//!
//! Snapshots are never persisted; sensors rebuild them after every start.

use serde::{Deserialize, Serialize};

/// Kind of network a record needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    NotRequired,
    Connected,
    Unmetered,
    NotRoaming,
    Metered,
}

impl std::str::FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "not_required" => Ok(NetworkType::NotRequired),
            "connected" => Ok(NetworkType::Connected),
            "unmetered" => Ok(NetworkType::Unmetered),
            "not_roaming" => Ok(NetworkType::NotRoaming),
            "metered" => Ok(NetworkType::Metered),
            _ => Err(format!("unknown network type: {s}")),
        }
    }
}

/// Requirement set declared by a work record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    pub network: NetworkType,
    pub requires_charging: bool,
    pub requires_device_idle: bool,
    pub requires_battery_not_low: bool,
    pub requires_storage_not_low: bool,
}

impl Constraints {
    /// No requirements at all. Such records bypass the tracker.
    pub fn is_empty(&self) -> bool {
        *self == Constraints::default()
    }

    pub fn network(mut self, network: NetworkType) -> Self {
        self.network = network;
        self
    }

    pub fn charging(mut self) -> Self {
        self.requires_charging = true;
        self
    }

    pub fn device_idle(mut self) -> Self {
        self.requires_device_idle = true;
        self
    }

    pub fn battery_not_low(mut self) -> Self {
        self.requires_battery_not_low = true;
        self
    }

    pub fn storage_not_low(mut self) -> Self {
        self.requires_storage_not_low = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkState {
    pub connected: bool,
    pub unmetered: bool,
    pub roaming: bool,
}

impl NetworkState {
    pub fn satisfies(&self, required: NetworkType) -> bool {
        match required {
            NetworkType::NotRequired => true,
            NetworkType::Connected => self.connected,
            NetworkType::Unmetered => self.connected && self.unmetered,
            NetworkType::NotRoaming => self.connected && !self.roaming,
            NetworkType::Metered => self.connected && !self.unmetered,
        }
    }
}

/// Currently-true environment conditions.
///
/// The default snapshot has nothing true: until a sensor reports, only
/// unconstrained work is eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConstraintSnapshot {
    pub network: NetworkState,
    pub charging: bool,
    pub device_idle: bool,
    pub battery_not_low: bool,
    pub storage_not_low: bool,
}

impl ConstraintSnapshot {
    /// Every condition holds. Used by hosts without sensors.
    pub fn unrestricted() -> Self {
        Self {
            network: NetworkState {
                connected: true,
                unmetered: true,
                roaming: false,
            },
            charging: true,
            device_idle: true,
            battery_not_low: true,
            storage_not_low: true,
        }
    }

    pub fn satisfies(&self, constraints: &Constraints) -> bool {
        self.network.satisfies(constraints.network)
            && (!constraints.requires_charging || self.charging)
            && (!constraints.requires_device_idle || self.device_idle)
            && (!constraints.requires_battery_not_low || self.battery_not_low)
            && (!constraints.requires_storage_not_low || self.storage_not_low)
    }

    /// Apply a sensor delta. Returns true if anything changed.
    pub fn apply(&mut self, delta: &ConstraintDelta) -> bool {
        let before = *self;
        set(&mut self.network.connected, delta.connected);
        set(&mut self.network.unmetered, delta.unmetered);
        set(&mut self.network.roaming, delta.roaming);
        set(&mut self.charging, delta.charging);
        set(&mut self.device_idle, delta.device_idle);
        set(&mut self.battery_not_low, delta.battery_not_low);
        set(&mut self.storage_not_low, delta.storage_not_low);
        before != *self
    }
}

fn set(field: &mut bool, value: Option<bool>) {
    if let Some(v) = value {
        *field = v;
    }
}

/// Partial update pushed by a sensor. `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintDelta {
    pub connected: Option<bool>,
    pub unmetered: Option<bool>,
    pub roaming: Option<bool>,
    pub charging: Option<bool>,
    pub device_idle: Option<bool>,
    pub battery_not_low: Option<bool>,
    pub storage_not_low: Option<bool>,
}

impl ConstraintDelta {
    pub fn network(connected: bool) -> Self {
        Self {
            connected: Some(connected),
            ..Self::default()
        }
    }

    pub fn unmetered(mut self, unmetered: bool) -> Self {
        self.unmetered = Some(unmetered);
        self
    }

    pub fn roaming(mut self, roaming: bool) -> Self {
        self.roaming = Some(roaming);
        self
    }

    pub fn charging(mut self, charging: bool) -> Self {
        self.charging = Some(charging);
        self
    }

    pub fn device_idle(mut self, idle: bool) -> Self {
        self.device_idle = Some(idle);
        self
    }

    pub fn battery_not_low(mut self, ok: bool) -> Self {
        self.battery_not_low = Some(ok);
        self
    }

    pub fn storage_not_low(mut self, ok: bool) -> Self {
        self.storage_not_low = Some(ok);
        self
    }
}
