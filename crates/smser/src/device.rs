//! Per-device bring-up and shutdown.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use smser_at::ProtocolEngine;
use tracing::{error, info};

use crate::config::DeviceConfig;
use crate::courier::Courier;
use crate::error::StartupError;
use crate::sms::{spawn_sms_worker, SmsForwarder, SmsJob, SmsPipeline};
use crate::transport::{open_transport, spawn_reader};

/// A running device: engine, reader and SMS worker.
pub struct DeviceHandle {
    name: String,
    engine: Arc<ProtocolEngine>,
    sms_queue: Sender<SmsJob>,
    sms_worker: JoinHandle<()>,
    // Not joined: a blocking read cannot be interrupted.
    _reader: JoinHandle<()>,
}

impl DeviceHandle {
    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device's protocol engine.
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Stop the engine and wait for the event thread and SMS worker.
    ///
    /// Messages already queued for the worker are still forwarded.
    pub fn shutdown(self) {
        info!("Device[{}]: shutting down", self.name);
        self.engine.stop();
        self.engine.join();
        let _ = self.sms_queue.send(SmsJob::Shutdown);
        if self.sms_worker.join().is_err() {
            error!("Device[{}]: SMS worker panicked", self.name);
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name)
            .field("engine", &self.engine)
            .finish()
    }
}

/// Open a device, start its threads and send its init commands.
///
/// `targets` are the chat ids receiving this device's messages.
pub fn start_device(
    config: &DeviceConfig,
    targets: Vec<String>,
    command_timeout: Duration,
    courier: Arc<Courier>,
) -> Result<DeviceHandle, StartupError> {
    info!("Device[{}]: starting on {}", config.name, config.device);
    let transport = open_transport(&config.device, config.baudrate).map_err(|source| StartupError::Open {
        device: config.name.clone(),
        locator: config.device.clone(),
        source,
    })?;

    let (sms_queue, sms_rx) = crossbeam_channel::unbounded();
    let pipeline = Arc::new(SmsPipeline::new(&config.name, sms_queue.clone()));
    let engine = ProtocolEngine::start(&config.name, transport.writer, pipeline, command_timeout);
    let reader = spawn_reader(&config.name, transport.reader, Arc::clone(&engine));

    let forwarder = Arc::new(SmsForwarder::new(&config.name, targets, courier));
    let sms_worker = spawn_sms_worker(&config.name, sms_rx, forwarder);

    let failed = run_init_commands(&engine, &config.init_commands);
    if failed > 0 {
        error!("Device[{}]: {} init commands failed", config.name, failed);
    }
    info!("Device[{}]: ready", config.name);

    Ok(DeviceHandle {
        name: config.name.clone(),
        engine,
        sms_queue,
        sms_worker,
        _reader: reader,
    })
}

/// Send each command in order; failures are logged and skipped.
///
/// Returns the number of failed commands.
pub fn run_init_commands(engine: &ProtocolEngine, commands: &[String]) -> usize {
    let mut failed = 0;
    for command in commands {
        if let Err(e) = engine.command(command) {
            error!("Device[{}]: init command '{}' failed: {}", engine.name(), command, e);
            failed += 1;
        }
    }
    failed
}
