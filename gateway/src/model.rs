use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Liveness/activity status of a device, derived from telemetry and commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
    Watering,
}

impl DeviceStatus {
    /// Status implied by the actuator flag of a live device
    pub fn from_pump(pump_active: bool) -> Self {
        if pump_active {
            DeviceStatus::Watering
        } else {
            DeviceStatus::Online
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Watering => "watering",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            "watering" => Ok(DeviceStatus::Watering),
            other => Err(format!("unknown device status '{}'", other)),
        }
    }
}

/// Operating mode, set by operators and consumed by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Auto,
    Manual,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Manual => "manual",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Mode::Auto),
            "manual" => Ok(Mode::Manual),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// Last reported state of an irrigation device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub zone: String,
    pub zone_label: String,
    pub ip: Option<String>,
    pub status: DeviceStatus,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<i32>,
    pub pump_active: bool,
    pub mode: Mode,
    pub last_update: DateTime<Utc>,
}

impl Device {
    pub fn new(registration: NewDevice, now: DateTime<Utc>) -> Self {
        Self {
            id: registration.id,
            name: registration.name,
            zone: registration.zone,
            zone_label: registration.zone_label,
            ip: registration.ip,
            status: DeviceStatus::Offline,
            temperature: None,
            humidity: None,
            soil_moisture: None,
            pump_active: false,
            mode: Mode::Auto,
            last_update: now,
        }
    }

    /// Copy suitable for dashboards and API clients.
    ///
    /// Sensor values of an offline device are stale, so they are reported as
    /// unknown rather than as the last values received.
    pub fn reported(&self) -> Device {
        let mut view = self.clone();
        if view.status == DeviceStatus::Offline {
            view.temperature = None;
            view.humidity = None;
            view.soil_moisture = None;
        }
        view
    }
}

/// Registration request for a new device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub zone_label: String,
    #[serde(default)]
    pub ip: Option<String>,
}

/// Partial device update; only `Some` fields are applied
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePatch {
    pub name: Option<String>,
    pub zone: Option<String>,
    pub zone_label: Option<String>,
    pub ip: Option<String>,
    pub status: Option<DeviceStatus>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<i32>,
    pub pump_active: Option<bool>,
    pub mode: Option<Mode>,
}

impl DevicePatch {
    /// Patch produced by an accepted telemetry reading
    pub fn from_reading(reading: &Reading) -> Self {
        let pump_active = reading.pump_active.unwrap_or(false);
        Self {
            ip: reading.ip.clone(),
            status: Some(DeviceStatus::from_pump(pump_active)),
            temperature: Some(reading.temperature),
            humidity: Some(reading.humidity),
            soil_moisture: Some(reading.soil_percent),
            pump_active: Some(pump_active),
            ..Default::default()
        }
    }

    pub fn pump(on: bool) -> Self {
        Self {
            status: Some(DeviceStatus::from_pump(on)),
            pump_active: Some(on),
            ..Default::default()
        }
    }

    pub fn mode(mode: Mode) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn offline() -> Self {
        Self {
            status: Some(DeviceStatus::Offline),
            ..Default::default()
        }
    }

    /// Restricts a patch to the descriptive fields an administrator may edit
    pub fn administrative(self) -> Self {
        Self {
            name: self.name,
            zone: self.zone,
            zone_label: self.zone_label,
            ..Default::default()
        }
    }

    pub fn apply(&self, device: &mut Device, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            device.name = name.clone();
        }
        if let Some(zone) = &self.zone {
            device.zone = zone.clone();
        }
        if let Some(zone_label) = &self.zone_label {
            device.zone_label = zone_label.clone();
        }
        if let Some(ip) = &self.ip {
            device.ip = Some(ip.clone());
        }
        if let Some(status) = self.status {
            device.status = status;
        }
        if let Some(temperature) = self.temperature {
            device.temperature = Some(temperature);
        }
        if let Some(humidity) = self.humidity {
            device.humidity = Some(humidity);
        }
        if let Some(soil_moisture) = self.soil_moisture {
            device.soil_moisture = Some(soil_moisture);
        }
        if let Some(pump_active) = self.pump_active {
            device.pump_active = pump_active;
        }
        if let Some(mode) = self.mode {
            device.mode = mode;
        }
        device.last_update = now;
    }
}

/// Inbound telemetry payload as published by the firmware
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_percent: f64,
    #[serde(default)]
    pub pump_active: Option<bool>,
    #[serde(default)]
    pub ip: Option<String>,
}

/// A validated telemetry reading
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_percent: i32,
    pub pump_active: Option<bool>,
    pub ip: Option<String>,
}

/// One time-series row of sensor history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SensorSample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub soil_moisture: i32,
}

impl SensorSample {
    pub fn from_reading(device_id: &str, reading: &Reading, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp,
            temperature: reading.temperature,
            humidity: reading.humidity,
            soil_moisture: reading.soil_percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Post-mutation snapshot of a device, fanned out to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub device: Device,
}

/// Outbound device-directed command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pump: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mode: Option<Mode>,
}

impl DeviceCommand {
    pub fn pump(on: bool) -> Self {
        Self {
            pump: Some(on),
            mode: None,
        }
    }

    pub fn mode(mode: Mode) -> Self {
        Self {
            pump: None,
            mode: Some(mode),
        }
    }
}

/// Time window and cap for a history lookup
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub limit: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| timestamp >= start)
            && self.end.map_or(true, |end| timestamp <= end)
    }
}
