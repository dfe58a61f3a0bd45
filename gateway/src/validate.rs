use crate::errors::{Error, Result};
use crate::model::{Reading, TelemetryPayload};

const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;
const SOIL_MIN: f64 = 0.0;
const SOIL_MAX: f64 = 100.0;

/// Parses and validates a raw telemetry payload
pub fn parse_reading(payload: &[u8]) -> Result<Reading> {
    let telemetry = serde_json::from_slice::<TelemetryPayload>(payload)
        .map_err(|e| Error::MalformedMessage(format!("JSON parse error: {}", e)))?;

    validate(&telemetry)?;

    Ok(Reading {
        temperature: telemetry.temperature,
        humidity: telemetry.humidity,
        soil_percent: telemetry.soil_percent.round() as i32,
        pump_active: telemetry.pump_active,
        ip: telemetry.ip.filter(|ip| !ip.is_empty()),
    })
}

/// Validates telemetry ranges.
///
/// Temperature is only required to be a finite number: a sensor reporting
/// an extreme value is still a device that is alive.
pub fn validate(telemetry: &TelemetryPayload) -> Result<()> {
    if !telemetry.temperature.is_finite() {
        return Err(Error::MalformedMessage(format!(
            "Temperature {} is not a finite number",
            telemetry.temperature
        )));
    }
    check_range("Humidity", telemetry.humidity, HUMIDITY_MIN, HUMIDITY_MAX)?;
    check_range("Soil moisture", telemetry.soil_percent, SOIL_MIN, SOIL_MAX)?;
    Ok(())
}

/// Validates a device id taken from a topic or a registration request
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(Error::MalformedMessage(
            "Device ID cannot be empty".to_string(),
        ));
    }
    if device_id.contains(['/', '+', '#']) {
        return Err(Error::MalformedMessage(format!(
            "Device ID '{}' contains MQTT topic characters",
            device_id
        )));
    }
    Ok(())
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<()> {
    // NaN fails both comparisons, so test finiteness explicitly
    if !value.is_finite() || value < min || value > max {
        return Err(Error::MalformedMessage(format!(
            "{} {} out of range [{}, {}]",
            field, value, min, max
        )));
    }
    Ok(())
}
