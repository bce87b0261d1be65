//! Component wiring
//!
//! Builds the selector, protocol adapters, engines and controllers from
//! settings. Nothing here touches hardware until a component is used.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use omenfan::backend::BackendSelector;
use omenfan::calibration::CalibrationStore;
use omenfan::data::{BackendKind, RegisterMapTable};
use omenfan::engine::{
    ApplyGate, FanActuator, FanControlEngine, FanVerificationEngine, TelemetryPoller, TokioClock,
};
use omenfan::power::{CpuVendor, PowerLimitController};
use omenfan::protocol::{
    DeviceFileTransport, FirmwareCommandProtocol, MailboxProtocol, ServiceProxyProtocol, SysinfoServiceProbe,
    UnixSocketBridge,
};
use omenfan::settings::AppSettings;

pub struct Runtime {
    pub settings: AppSettings,
    pub model_key: String,
    pub selector: Arc<BackendSelector>,
    pub engine: Arc<FanControlEngine>,
    pub gate: Arc<ApplyGate>,
    pub calibration: Arc<RwLock<CalibrationStore>>,
    pub calibration_path: PathBuf,
}

impl Runtime {
    pub fn build(settings: AppSettings, forced: Option<BackendKind>) -> Result<Self> {
        let model_key = settings.model_key();
        info!(model = %model_key, "Model identified");

        let selector = Arc::new(BackendSelector::with_default_providers(
            settings.signed_module_provider(),
            settings.direct_driver_provider(),
        ));
        selector.set_forced(forced.or(settings.backend.forced));

        let map = RegisterMapTable::builtin().resolve(&model_key, settings.fan.register_map.as_ref());
        if map.is_none() {
            warn!(model = %model_key, "No register map for this model; EC writes disabled");
        }

        let mut engine = FanControlEngine::new(Arc::clone(&selector), settings.engine_config(&model_key, map))
            .context("invalid fan register configuration")?;

        let transport = DeviceFileTransport::new(&settings.backend.firmware_device);
        if transport.exists() {
            engine = engine.with_firmware(Arc::new(FirmwareCommandProtocol::new(Arc::new(transport))));
        } else {
            debug!(path = %settings.backend.firmware_device.display(), "Firmware command device absent");
        }

        let bridge = UnixSocketBridge::new(&settings.backend.service_socket)
            .with_timeout(Duration::from_millis(settings.backend.service_timeout_ms));
        let service = ServiceProxyProtocol::new(Arc::new(SysinfoServiceProbe), Arc::new(bridge));
        if service.initialize().is_available() {
            engine = engine.with_service_proxy(Arc::new(service));
        }

        let gate = Arc::new(ApplyGate::new());
        let calibration_path = CalibrationStore::default_path();
        let calibration = Arc::new(RwLock::new(CalibrationStore::load(&calibration_path)));

        Ok(Self {
            settings,
            model_key,
            selector,
            engine: Arc::new(engine),
            gate,
            calibration,
            calibration_path,
        })
    }

    /// Log which backend is in use, or why none is
    pub fn report_backend(&self) {
        self.selector.acquire();
        let status = self.selector.status();
        if status.available {
            info!(kind = %status.kind, "{}", status.status_message);
        } else {
            warn!("{}", status.status_message);
        }
    }

    /// Preset and power limits from settings
    pub fn apply_startup(&self) -> Result<()> {
        if let Some(mode) = &self.settings.fan.performance_mode {
            match self.engine.apply_preset(mode) {
                Ok(applied) => info!(mode = %applied, "Performance mode applied"),
                Err(e) => warn!(mode = %mode, error = %e, "Performance mode not applied"),
            }
        }

        if !self.settings.power.is_empty() {
            let layout = self.settings.mailbox_layout()?;
            let controller = PowerLimitController::new(Arc::clone(&self.selector), CpuVendor::detect())
                .with_mailbox(Arc::new(MailboxProtocol::new(Arc::clone(&self.selector), layout)));
            info!(vendor = %controller.vendor(), "Applying power limits");
            controller.apply_settings(&self.settings.power);
        }
        Ok(())
    }

    pub fn poller(&self) -> TelemetryPoller {
        let poller = TelemetryPoller::new(Arc::clone(&self.engine), Arc::clone(&self.gate))
            .with_interval(self.settings.poll_interval());
        match self.settings.active_curves() {
            Some(curves) => poller.with_curves(curves, self.settings.fan.min_delta_percent),
            None => poller,
        }
    }

    pub fn verifier(&self) -> FanVerificationEngine {
        let actuator: Arc<dyn FanActuator> = self.engine.clone();
        FanVerificationEngine::new(
            actuator,
            Arc::clone(&self.calibration),
            Arc::clone(&self.gate),
            Arc::new(TokioClock),
        )
        .with_config(self.settings.verification_config())
    }

    /// Hand fans back to firmware and close the backend
    pub async fn shutdown(&self) {
        if !self.engine.reset_to_defaults().await {
            warn!("Fans could not be handed back to firmware control");
        }
        self.selector.shutdown();
    }
}
