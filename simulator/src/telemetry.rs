use rand::Rng;
use serde::{Deserialize, Serialize};

/// Payload published on `{prefix}/{device_id}/telemetry`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_percent: f64,
    pub pump_active: bool,
}

/// Command received on `{prefix}/{device_id}/command`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Command {
    pub pump: Option<bool>,
    pub mode: Option<String>,
}

const DRY_THRESHOLD: f64 = 25.0;
const WET_THRESHOLD: f64 = 60.0;

/// One simulated irrigation controller
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    temperature: f64,
    humidity: f64,
    soil: f64,
    pump_active: bool,
    auto_mode: bool,
}

impl VirtualDevice {
    pub fn new(rng: &mut impl Rng) -> Self {
        Self {
            temperature: rng.gen_range(15.0..30.0),
            humidity: rng.gen_range(40.0..70.0),
            soil: rng.gen_range(30.0..70.0),
            pump_active: false,
            auto_mode: true,
        }
    }

    /// Advances the device by one reporting interval
    pub fn step(&mut self, rng: &mut impl Rng) -> Telemetry {
        self.temperature = (self.temperature + rng.gen_range(-0.5..0.5)).clamp(-10.0, 45.0);
        self.humidity = (self.humidity + rng.gen_range(-1.0..1.0)).clamp(5.0, 100.0);

        if self.pump_active {
            self.soil += rng.gen_range(2.0..5.0);
        } else {
            self.soil -= rng.gen_range(0.2..1.5);
        }
        self.soil = self.soil.clamp(0.0, 100.0);

        if self.auto_mode {
            if self.soil < DRY_THRESHOLD {
                self.pump_active = true;
            } else if self.soil > WET_THRESHOLD {
                self.pump_active = false;
            }
        }

        Telemetry {
            temperature: round1(self.temperature),
            humidity: round1(self.humidity),
            soil_percent: self.soil.round(),
            pump_active: self.pump_active,
        }
    }

    pub fn apply(&mut self, command: &Command) {
        if let Some(mode) = command.mode.as_deref() {
            self.auto_mode = mode == "auto";
        }
        if let Some(pump) = command.pump {
            self.pump_active = pump;
        }
    }

    pub fn pump_active(&self) -> bool {
        self.pump_active
    }

    pub fn auto_mode(&self) -> bool {
        self.auto_mode
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
