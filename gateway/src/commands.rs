use crate::errors::{Error, Result};
use crate::metrics::{COMMANDS_TOTAL, TRANSPORT_FAILURES_TOTAL};
use crate::model::{Device, DeviceCommand, DevicePatch, Mode};
use crate::registry::DeviceRegistry;
use std::sync::Arc;
use tracing::{info, warn};

/// Outbound channel to devices.
///
/// Implementations must return promptly; delivery is fire-and-forget.
pub trait CommandTransport: Send + Sync {
    fn send(&self, device_id: &str, command: &DeviceCommand) -> Result<()>;
}

/// Turns operator intents into device commands and registry updates
pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn CommandTransport>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<DeviceRegistry>, transport: Arc<dyn CommandTransport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    pub fn set_pump(&self, device_id: &str, on: bool) -> Result<Device> {
        self.dispatch(device_id, DeviceCommand::pump(on), DevicePatch::pump(on))
    }

    pub fn set_mode(&self, device_id: &str, mode: Mode) -> Result<Device> {
        self.dispatch(device_id, DeviceCommand::mode(mode), DevicePatch::mode(mode))
    }

    /// Sends `command` and records the operator's intent in the registry.
    ///
    /// The registry is updated even when the transport fails: the device
    /// corrects its reported state with its next telemetry message.
    fn dispatch(&self, device_id: &str, command: DeviceCommand, patch: DevicePatch) -> Result<Device> {
        if !self.registry.contains(device_id) {
            return Err(Error::NotFound(device_id.to_string()));
        }

        COMMANDS_TOTAL.inc();
        match self.transport.send(device_id, &command) {
            Ok(()) => info!(device_id = %device_id, ?command, "Command sent"),
            Err(e) => {
                TRANSPORT_FAILURES_TOTAL.inc();
                warn!(device_id = %device_id, ?command, "Command not delivered: {}", e);
            }
        }

        self.registry.update(device_id, &patch)
    }
}
