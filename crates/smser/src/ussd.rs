//! Periodic USSD balance checks.
//!
//! The [`UssdScheduler`] owns every [`UssdTask`] across all devices and
//! evaluates them one after another once per tick. A due task sends
//! `AT+CUSD=1,"<code>",15` with a one-shot subscription armed for the
//! `+CUSD` reply; the reply closes the session, and the balance text is
//! delivered to the task's chats through the shared [`Courier`]. After all
//! tasks, the courier's retry queue is flushed.
//!
//! Due window: `hour_from <= now.hour < hour_till`, and at least the period
//! has passed since the last run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, Timelike};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use smser_at::{
    AtCommand, AtError, Delivery, Event, EventArg, Invocation, OneShot, ProtocolEngine, Subscription,
    EVENT_USSD_REPLY,
};
use tracing::{error, info, warn};

use crate::courier::{Courier, PendingMessage};
use crate::error::UssdError;
use crate::sms::TIMESTAMP_FORMAT;

/// Time between scheduler ticks.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Data coding scheme of UCS-2 USSD replies (text is hex encoded).
pub const USSD_DCS_UCS2: i64 = 72;

/// Largest period chrono can represent, in seconds.
const MAX_PERIOD_SECS: i64 = i64::MAX / 1000;

/// Session status reported in a `+CUSD` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UssdStatus {
    /// No further action required.
    Done,
    /// The network expects a further answer.
    ActionRequired,
    /// The network terminated the session.
    Terminated,
    /// Another local client responded.
    OtherClient,
    /// The operation is not supported.
    NotSupported,
    /// The network timed out.
    NetworkTimeout,
}

impl UssdStatus {
    /// Status for a numeric code, if recognized.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(UssdStatus::Done),
            1 => Some(UssdStatus::ActionRequired),
            2 => Some(UssdStatus::Terminated),
            3 => Some(UssdStatus::OtherClient),
            4 => Some(UssdStatus::NotSupported),
            5 => Some(UssdStatus::NetworkTimeout),
            _ => None,
        }
    }

    /// Whether the reply carries a normal answer.
    pub fn is_answer(&self) -> bool {
        matches!(self, UssdStatus::Done | UssdStatus::ActionRequired)
    }

    /// Human readable name.
    pub fn description(&self) -> &'static str {
        match self {
            UssdStatus::Done => "done",
            UssdStatus::ActionRequired => "action required",
            UssdStatus::Terminated => "terminated by network",
            UssdStatus::OtherClient => "answered by another client",
            UssdStatus::NotSupported => "not supported",
            UssdStatus::NetworkTimeout => "network timeout",
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// One configured balance check.
pub struct UssdTask {
    /// Device name.
    pub device: String,
    /// Engine of the device.
    pub engine: Arc<ProtocolEngine>,
    /// USSD code, e.g. `*100#`.
    pub code: String,
    /// Chat ids receiving the result.
    pub targets: Vec<String>,
    /// Minimum seconds between runs.
    pub period_seconds: u64,
    /// First hour (inclusive) a run may start.
    pub hour_from: Option<u32>,
    /// Hour (exclusive) from which runs stop.
    pub hour_till: Option<u32>,
    /// When the task last ran.
    pub last_run: Option<NaiveDateTime>,
    reply: Option<Arc<dyn Subscription>>,
}

impl UssdTask {
    /// Create a task that has never run.
    pub fn new(
        device: impl Into<String>,
        engine: Arc<ProtocolEngine>,
        code: impl Into<String>,
        targets: Vec<String>,
        period_seconds: u64,
        hour_from: Option<u32>,
        hour_till: Option<u32>,
    ) -> Self {
        UssdTask {
            device: device.into(),
            engine,
            code: code.into(),
            targets,
            period_seconds,
            hour_from,
            hour_till,
            last_run: None,
            reply: None,
        }
    }

    /// Whether the task should run at `now`.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        let hour = now.hour();
        let after_start = self.hour_from.map_or(true, |from| hour >= from);
        let before_end = self.hour_till.map_or(true, |till| hour < till);
        let elapsed = match self.last_run {
            None => true,
            Some(last) => last
                .checked_add_signed(self.period())
                .is_some_and(|next| now >= next),
        };
        after_start && before_end && elapsed
    }

    /// Minimum time between runs.
    pub fn period(&self) -> chrono::Duration {
        let secs = i64::try_from(self.period_seconds).unwrap_or(i64::MAX).min(MAX_PERIOD_SECS);
        chrono::Duration::seconds(secs)
    }

    /// Whether a reply subscription from the last run is still waiting.
    pub fn awaiting_reply(&self) -> bool {
        self.reply.as_ref().is_some_and(|r| r.is_active())
    }
}

impl std::fmt::Debug for UssdTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UssdTask")
            .field("device", &self.device)
            .field("code", &self.code)
            .field("period_seconds", &self.period_seconds)
            .field("hour_from", &self.hour_from)
            .field("hour_till", &self.hour_till)
            .field("last_run", &self.last_run)
            .finish()
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Tick loop over all balance checks.
pub struct UssdScheduler {
    tasks: Mutex<Vec<UssdTask>>,
    courier: Arc<Courier>,
}

impl UssdScheduler {
    /// Create a scheduler over `tasks`.
    pub fn new(tasks: Vec<UssdTask>, courier: Arc<Courier>) -> Self {
        UssdScheduler {
            tasks: Mutex::new(tasks),
            courier,
        }
    }

    /// Last run time of each task, in configured order.
    pub fn last_runs(&self) -> Vec<Option<NaiveDateTime>> {
        self.tasks.lock().iter().map(|t| t.last_run).collect()
    }

    /// Evaluate every task once, then retry delayed messages.
    ///
    /// Tasks run sequentially; a slow command delays the tasks after it.
    /// A failure in one task does not affect the others. A task's run time
    /// is `now` plus the time spent in this tick until its initiation
    /// command returned.
    pub fn tick(&self, now: NaiveDateTime) {
        let started = Instant::now();
        {
            let mut tasks = self.tasks.lock();
            for task in tasks.iter_mut() {
                if !task.is_due(now) {
                    continue;
                }
                match panic::catch_unwind(AssertUnwindSafe(|| self.run_task(task, now, started))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("UssdScheduler: {}", e),
                    Err(_) => error!(
                        "UssdScheduler: task '{}' for device '{}' panicked",
                        task.code, task.device
                    ),
                }
            }
        }
        self.courier.flush();
    }

    fn run_task(&self, task: &mut UssdTask, now: NaiveDateTime, started: Instant) -> Result<(), UssdError> {
        info!("UssdScheduler: running USSD task '{}' for device '{}'", task.code, task.device);

        if let Some(stale) = task.reply.take() {
            if stale.is_active() {
                warn!(
                    "UssdScheduler: no reply to the previous '{}' on '{}', dropping its subscription",
                    task.code, task.device
                );
                stale.unsubscribe();
            }
        }

        let subscription: Arc<dyn Subscription> = Arc::new(OneShot::new(
            EVENT_USSD_REPLY,
            reply_handler(
                task.device.clone(),
                task.code.clone(),
                task.targets.clone(),
                Arc::downgrade(&task.engine),
                Arc::clone(&self.courier),
            ),
        ));
        task.reply = Some(Arc::clone(&subscription));

        let invocation = Invocation::from(AtCommand::UssdRequest {
            code: task.code.clone(),
        })
        .subscribe(subscription);

        let result = task.engine.send_command(&invocation);
        if matches!(result, Ok(_) | Err(AtError::Protocol { .. })) {
            let returned_at = chrono::Duration::from_std(started.elapsed())
                .ok()
                .and_then(|elapsed| now.checked_add_signed(elapsed))
                .unwrap_or(now);
            task.last_run = Some(returned_at);
        }
        result.map(|_| ()).map_err(|source| UssdError::Initiation {
            device: task.device.clone(),
            code: task.code.clone(),
            source,
        })
    }

    /// Tick every [`TICK_INTERVAL`] until `shutdown` fires or disconnects.
    pub fn run(&self, shutdown: Receiver<()>) {
        info!("UssdScheduler: started with {} tasks", self.tasks.lock().len());
        loop {
            self.tick(Local::now().naive_local());
            match shutdown.recv_timeout(TICK_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("UssdScheduler: stopped");
    }

    /// Run the tick loop on its own thread.
    pub fn spawn(self: Arc<Self>, shutdown: Receiver<()>) -> JoinHandle<()> {
        thread::Builder::new()
            .name("ussd-scheduler".to_string())
            .spawn(move || self.run(shutdown))
            .expect("Failed to spawn USSD scheduler thread")
    }
}

/// Completion logic for one USSD request, run on the engine's event thread.
fn reply_handler(
    device: String,
    code: String,
    targets: Vec<String>,
    engine: Weak<ProtocolEngine>,
    courier: Arc<Courier>,
) -> impl FnMut(&Event) -> Delivery + Send {
    move |event: &Event| {
        let Some(status) = event.expect_int(0).ok().and_then(UssdStatus::from_code) else {
            warn!("UssdScheduler: unrecognized USSD reply on '{}': {}", device, event);
            return Delivery::Ignored;
        };

        if let Some(engine) = engine.upgrade() {
            if let Err(e) = engine.execute(&AtCommand::UssdCancel) {
                warn!("UssdScheduler: failed to close USSD session on '{}': {}", device, e);
            }
        }

        let text = format_balance(&device, Local::now().naive_local(), status, &reply_text(event));
        info!("UssdScheduler: '{}' on '{}' answered ({})", code, device, status.description());
        for target in &targets {
            courier.deliver(PendingMessage {
                target: target.clone(),
                text: text.clone(),
                description: format!("USSD '{}' result for '{}'", code, device),
            });
        }
        Delivery::Consumed
    }
}

/// Reply text, decoding UCS-2 hex when the reply's coding scheme says so.
pub fn reply_text(event: &Event) -> String {
    let raw = match event.arg(1) {
        Ok(EventArg::Str(s)) => s.clone(),
        Ok(other) => other.to_string(),
        Err(_) => return String::new(),
    };
    if event.expect_int(2).ok() == Some(USSD_DCS_UCS2) {
        if let Ok(decoded) = smser_pdu::decode_ucs2_hex(&raw) {
            return decoded;
        }
    }
    raw
}

/// Text of a balance check result.
pub fn format_balance(device: &str, at: NaiveDateTime, status: UssdStatus, text: &str) -> String {
    let mut message = format!("Balance check for {} at {}:\n{}", device, at.format(TIMESTAMP_FORMAT), text);
    if !status.is_answer() {
        message.push_str(&format!("\n({})", status.description()));
    }
    message
}
