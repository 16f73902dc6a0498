//! UPS poller.
//!
//! Owns the cached telemetry for one UPS and refreshes it on a timer:
//! connect over SSH, run the status command, parse its output, publish the
//! derived characteristics, release the session, sleep, repeat. Cycles never
//! overlap; the next one is scheduled only after the previous one finished,
//! whatever its outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accessory::{Accessory, AccessoryRegistry};
use crate::config::UpsConfig;
use crate::errors::{PollError, RegistryError};
use crate::hap::{Characteristic, CharacteristicValue, ChargingState, Service, ServiceKind};
use crate::nut;
use crate::remote::{CommandOutput, RemoteSession, RemoteShell, SshTarget};
use crate::telemetry::{SharedTelemetry, TelemetrySnapshot};

/// Plugin half of the registration pair
pub const PLUGIN_NAME: &str = "homebridge-synology-upsinfo";

/// Accessory type half of the registration pair
pub const ACCESSORY_NAME: &str = "SynologyUPSInfo";

/// Display name of the optional load sensor
pub const LOAD_SERVICE_NAME: &str = "UPS Load";

/// Where the refresh cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Connecting,
    Executing,
    Parsing,
    Publishing,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerStatus {
    pub phase: CyclePhase,
    /// Completed cycles, successful or not
    pub cycles: u64,
    pub failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for PollerStatus {
    fn default() -> Self {
        Self {
            phase: CyclePhase::Idle,
            cycles: 0,
            failures: 0,
            last_success: None,
            last_error: None,
        }
    }
}

/// How a single cycle ended
#[derive(Debug)]
pub enum CycleOutcome {
    /// Output was parsed and the characteristics were pushed
    Published(TelemetrySnapshot),
    /// The command printed nothing on stdout
    NoOutput,
    Failed(PollError),
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::Failed(_))
    }
}

/// Point-in-time view of a poller, printed by `upsinfod --once`
#[derive(Debug, Clone, Serialize)]
pub struct PollerReport {
    pub name: String,
    pub target: String,
    pub status: PollerStatus,
    pub telemetry: TelemetrySnapshot,
    pub low_battery: bool,
    pub published_load: Option<f64>,
}

struct PollerInner {
    config: UpsConfig,
    shell: Arc<dyn RemoteShell>,
    telemetry: SharedTelemetry,
    battery_service: Arc<Service>,
    load_service: Option<Arc<Service>>,
    status: Mutex<PollerStatus>,
}

pub struct UpsPoller {
    inner: Arc<PollerInner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UpsPoller {
    /// Build the poller and its services without starting the refresh loop
    pub fn new(config: UpsConfig, shell: Arc<dyn RemoteShell>) -> Self {
        let telemetry = SharedTelemetry::new(TelemetrySnapshot::default());

        let battery_service = Service::new(ServiceKind::Battery, config.name.clone());
        let source = telemetry.clone();
        battery_service.on_get(Characteristic::BatteryLevel, move || {
            CharacteristicValue::Int(source.charge())
        });
        let source = telemetry.clone();
        battery_service.on_get(Characteristic::StatusLowBattery, move || {
            CharacteristicValue::Bool(source.low_battery())
        });
        battery_service.on_get(Characteristic::ChargingState, || ChargingState::NotCharging.into());

        let load_service = config.include_load_sensor.then(|| {
            let service = Service::new(ServiceKind::HumiditySensor, LOAD_SERVICE_NAME);
            let source = telemetry.clone();
            service.on_get(Characteristic::CurrentRelativeHumidity, move || {
                CharacteristicValue::Float(source.published_load())
            });
            service
        });

        Self {
            inner: Arc::new(PollerInner {
                config,
                shell,
                telemetry,
                battery_service,
                load_service,
                status: Mutex::new(PollerStatus::default()),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Build the poller and start refreshing right away.
    ///
    /// Must be called from within a tokio runtime. The first cycle runs in
    /// the background; this returns immediately.
    pub fn start(config: UpsConfig, shell: Arc<dyn RemoteShell>) -> Self {
        let poller = Self::new(config, shell);
        poller.spawn();
        poller
    }

    /// Start the refresh loop if it is not running yet
    pub fn spawn(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }
        *task = Some(tokio::spawn(refresh_loop(
            Arc::clone(&self.inner),
            self.cancel.clone(),
        )));
    }

    /// Run one cycle inline, outside the refresh loop
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.inner.run_cycle().await
    }

    /// Stop the refresh loop. An in-flight cycle is dropped, closing its session.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("[{}] Stopping UPS poller", self.inner.config.name);
        }
        self.cancel.cancel();
    }

    /// Wait for the refresh loop to exit after `shutdown`
    pub async fn stopped(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn config(&self) -> &UpsConfig {
        &self.inner.config
    }

    pub fn charge(&self) -> i64 {
        self.inner.telemetry.charge()
    }

    pub fn low_battery(&self) -> bool {
        self.inner.telemetry.low_battery()
    }

    /// Charging cannot be read from `upsc` output, so this never changes
    pub fn charging_state(&self) -> ChargingState {
        ChargingState::NotCharging
    }

    /// Floored load, when the load sensor is enabled
    pub fn load(&self) -> Option<f64> {
        self.inner
            .config
            .include_load_sensor
            .then(|| self.inner.telemetry.published_load())
    }

    pub fn runtime_seconds(&self) -> u64 {
        self.inner.telemetry.runtime_seconds()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.telemetry.get()
    }

    pub fn status(&self) -> PollerStatus {
        self.inner.status()
    }

    pub fn report(&self) -> PollerReport {
        let telemetry = self.snapshot();
        PollerReport {
            name: self.inner.config.name.clone(),
            target: self.inner.config.target(),
            status: self.status(),
            telemetry,
            low_battery: telemetry.is_low_battery(),
            published_load: self.load(),
        }
    }

    /// Battery service, then the load sensor when enabled
    pub fn services(&self) -> Vec<Arc<Service>> {
        let mut services = vec![Arc::clone(&self.inner.battery_service)];
        if let Some(load) = &self.inner.load_service {
            services.push(Arc::clone(load));
        }
        services
    }
}

#[async_trait]
impl Accessory for UpsPoller {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn services(&self) -> Vec<Arc<Service>> {
        UpsPoller::services(self)
    }

    fn shutdown(&self) {
        UpsPoller::shutdown(self)
    }

    async fn stopped(&self) {
        UpsPoller::stopped(self).await
    }
}

impl Drop for UpsPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl PollerInner {
    fn status(&self) -> PollerStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).phase = phase;
    }

    async fn run_cycle(&self) -> CycleOutcome {
        let outcome = match self.poll().await {
            Ok(Some(snapshot)) => CycleOutcome::Published(snapshot),
            Ok(None) => CycleOutcome::NoOutput,
            Err(e) => {
                error!("[{}] UPS poll failed: {}", self.config.name, e);
                CycleOutcome::Failed(e)
            }
        };

        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.phase = CyclePhase::Idle;
        status.cycles += 1;
        match &outcome {
            CycleOutcome::Published(_) => {
                status.last_success = Some(Utc::now());
                status.last_error = None;
            }
            CycleOutcome::NoOutput => {}
            CycleOutcome::Failed(e) => {
                status.failures += 1;
                status.last_error = Some(e.to_string());
            }
        }
        drop(status);

        outcome
    }

    async fn poll(&self) -> Result<Option<TelemetrySnapshot>, PollError> {
        self.set_phase(CyclePhase::Connecting);
        let target = SshTarget::from_config(&self.config)?;
        let limit = self.config.ready_timeout;
        let mut session = timeout(limit, self.shell.connect(&target))
            .await
            .map_err(|_| PollError::ConnectTimeout(limit))??;

        let result = self.execute_and_publish(session.as_mut()).await;

        if let Err(e) = session.dispose().await {
            debug!("[{}] Ignoring error while closing session: {}", self.config.name, e);
        }

        result
    }

    async fn execute_and_publish(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<Option<TelemetrySnapshot>, PollError> {
        self.set_phase(CyclePhase::Executing);
        let output = self.execute(session).await?;

        if let Some(status) = output.exit_status.filter(|s| *s != 0) {
            debug!("[{}] '{}' exited with status {}", self.config.name, self.config.command, status);
        }

        if output.stdout.trim().is_empty() {
            let stderr = output.stderr.trim();
            if !stderr.is_empty() {
                warn!("[{}] UPS command stderr: {}", self.config.name, stderr);
            }
            return Ok(None);
        }

        self.set_phase(CyclePhase::Parsing);
        let reading = nut::parse(&output.stdout);
        let snapshot = self.telemetry.apply(&reading);
        debug!(
            "[{}] charge={} runtime={}s load={}",
            self.config.name, snapshot.charge, snapshot.runtime_seconds, snapshot.load_percent
        );

        self.set_phase(CyclePhase::Publishing);
        self.publish(&snapshot);
        Ok(Some(snapshot))
    }

    async fn execute(&self, session: &mut dyn RemoteSession) -> Result<CommandOutput, PollError> {
        let run = session.execute_command(&self.config.command);
        match self.config.command_timeout {
            Some(limit) => timeout(limit, run)
                .await
                .map_err(|_| PollError::CommandTimeout(limit))?,
            None => run.await,
        }
    }

    fn publish(&self, snapshot: &TelemetrySnapshot) {
        self.battery_service
            .update_characteristic(Characteristic::BatteryLevel, snapshot.charge);
        self.battery_service
            .update_characteristic(Characteristic::StatusLowBattery, snapshot.is_low_battery());

        if let Some(load) = &self.load_service {
            load.update_characteristic(
                Characteristic::CurrentRelativeHumidity,
                snapshot.published_load(),
            );
        }
    }
}

async fn refresh_loop(inner: Arc<PollerInner>, cancel: CancellationToken) {
    info!(
        "[{}] Polling {} every {:?}",
        inner.config.name,
        inner.config.target(),
        inner.config.poll_interval
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = inner.run_cycle() => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    }

    inner.set_phase(CyclePhase::Idle);
    debug!("[{}] Refresh loop exited", inner.config.name);
}

/// Register the UPS accessory type with the bridge.
///
/// Each created accessory starts polling immediately through `shell`.
pub fn register(registry: &mut AccessoryRegistry, shell: Arc<dyn RemoteShell>) -> Result<(), RegistryError> {
    registry.register_accessory(
        PLUGIN_NAME,
        ACCESSORY_NAME,
        Box::new(move |table: &toml::Table| {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(RegistryError::Construction {
                    accessory: ACCESSORY_NAME.to_string(),
                    reason: "no tokio runtime to poll from".to_string(),
                });
            }

            let config = UpsConfig::from_table(table);
            if config.host.is_none() {
                warn!("[{}] No host configured, every poll will fail", config.name);
            }
            Ok(Box::new(UpsPoller::start(config, Arc::clone(&shell))) as Box<dyn Accessory>)
        }),
    )
}
