//! GSM modem forwarder.
//!
//! Serves one or more modems over their AT command interface and forwards:
//!
//! - **Incoming SMS**: announced by `+CMTI`, read in PDU mode, decoded and
//!   sent to the device's recipients
//! - **Balance checks**: periodic USSD requests within an hour window, with
//!   the network's reply sent to the same recipients
//!
//! Delivery goes through a Telegram bot. Messages the API refuses are kept
//! in memory and retried every second until they go through.
//!
//! # Threads
//!
//! | Thread            | Count      | Role                                 |
//! |-------------------|------------|--------------------------------------|
//! | `at-reader-*`     | per device | reads the channel, classifies lines  |
//! | `at-event-*`      | per device | dispatches events, retrieves SMS     |
//! | `at-sms-*`        | per device | forwards retrieved SMS               |
//! | `ussd-scheduler`  | one        | balance checks, delivery retries     |

pub mod config;
pub mod courier;
pub mod device;
pub mod error;
pub mod sink;
pub mod sms;
pub mod transport;
pub mod ussd;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use tracing::{error, info};

pub use config::{load_config, load_config_from_str, Config};
pub use courier::{Courier, PendingMessage};
pub use device::{start_device, DeviceHandle};
pub use error::{ConfigError, SinkError, StartupError, UssdError};
pub use sink::{NotificationSink, TelegramSink};
pub use sms::{SmsForwarder, SmsHandler, SmsPipeline, SmsRecord};
pub use ussd::{UssdScheduler, UssdTask};

/// The running forwarder.
pub struct App {
    devices: Vec<DeviceHandle>,
    scheduler_stop: Sender<()>,
    scheduler: JoinHandle<()>,
}

impl App {
    /// Start every configured device and the scheduler, delivering through
    /// the Telegram bot from the config.
    pub fn start(config: &Config) -> Result<App, StartupError> {
        let sink = Arc::new(TelegramSink::new(&config.telegram_api_url, &config.telegram_bot_token)?);
        Self::start_with_sink(config, sink)
    }

    /// Start with a custom notification sink.
    ///
    /// Devices already started are shut down again if a later one fails.
    pub fn start_with_sink(config: &Config, sink: Arc<dyn NotificationSink>) -> Result<App, StartupError> {
        config.validate()?;
        let courier = Arc::new(Courier::new(sink));

        let mut devices: Vec<DeviceHandle> = Vec::with_capacity(config.devices.len());
        let mut tasks = Vec::new();
        for device in &config.devices {
            let started = config
                .chat_targets(device)
                .map_err(StartupError::from)
                .and_then(|targets| {
                    start_device(device, targets.clone(), config.command_timeout(), Arc::clone(&courier))
                        .map(|handle| (handle, targets))
                });
            let (handle, targets) = match started {
                Ok(started) => started,
                Err(e) => {
                    for handle in devices {
                        handle.shutdown();
                    }
                    return Err(e);
                }
            };

            for check in &device.balance_checks {
                tasks.push(UssdTask::new(
                    &device.name,
                    Arc::clone(handle.engine()),
                    &check.code,
                    targets.clone(),
                    check.period_seconds(),
                    check.hour_from,
                    check.hour_till,
                ));
            }
            devices.push(handle);
        }

        info!("App: {} devices, {} balance checks", devices.len(), tasks.len());
        let (scheduler_stop, stop_rx) = crossbeam_channel::bounded(1);
        let scheduler = Arc::new(UssdScheduler::new(tasks, courier)).spawn(stop_rx);

        Ok(App {
            devices,
            scheduler_stop,
            scheduler,
        })
    }

    /// Running devices.
    pub fn devices(&self) -> &[DeviceHandle] {
        &self.devices
    }

    /// Stop the scheduler and every device, waiting for their threads.
    pub fn shutdown(self) {
        info!("App: shutting down");
        let _ = self.scheduler_stop.send(());
        if self.scheduler.join().is_err() {
            error!("App: scheduler thread panicked");
        }
        for device in self.devices {
            device.shutdown();
        }
        info!("App: stopped");
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").field("devices", &self.devices).finish()
    }
}
