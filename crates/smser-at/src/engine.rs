//! Command/response correlation over a shared line channel.
//!
//! A modem interleaves two kinds of traffic on the same line stream:
//!
//! - **Responses** to the command currently in flight, ending with a terminal
//!   token (`OK` / `ERROR`)
//! - **Unsolicited events**, lines starting with `+`, that may arrive at any
//!   time, including between the lines of a response
//!
//! [`ProtocolEngine::classify`] routes every incoming line to exactly one of
//! two queues. Commands drain the response queue under an exclusive lock, so
//! at most one command is in flight per engine. A dedicated event thread
//! drains the event queue, runs the engine's [`EventHandler`] and then offers
//! the event to every active [`Subscription`].
//!
//! ## Threads
//!
//! | Thread          | Role                                              |
//! |-----------------|---------------------------------------------------|
//! | reader (caller) | calls [`ProtocolEngine::classify`] per line        |
//! | `at-event-*`    | parses and dispatches events                      |
//! | any             | calls [`ProtocolEngine::send_command`]            |
//!
//! Shutdown is cooperative: [`ProtocolEngine::stop`] clears the alive flag
//! and pushes a sentinel into both queues, which wakes every blocked waiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::commands::{AtCommand, Invocation};
use crate::error::{AtError, AtResult};
use crate::event::{Event, EVENT_PREFIX};
use crate::subscription::Subscription;
use crate::transport::LineWriter;

// ============================================================================
// Event Handler
// ============================================================================

/// Per-engine consumer of parsed events.
///
/// Runs on the engine's event thread before any subscription sees the event.
/// The engine is passed in so the handler can issue follow-up commands.
pub trait EventHandler: Send + Sync {
    /// Handle one parsed event.
    fn handle_event(&self, engine: &ProtocolEngine, event: &Event);
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {
    fn handle_event(&self, _engine: &ProtocolEngine, _event: &Event) {}
}

// ============================================================================
// Protocol Engine
// ============================================================================

/// Queue item; `Closed` is the shutdown sentinel.
#[derive(Debug)]
enum Incoming {
    Line(String),
    Closed,
}

/// AT protocol engine for one modem.
pub struct ProtocolEngine {
    name: String,
    alive: AtomicBool,
    default_timeout: Duration,
    /// Doubles as the command lock: holding it means owning the channel.
    writer: Mutex<Box<dyn LineWriter>>,
    response_tx: Sender<Incoming>,
    response_rx: Receiver<Incoming>,
    event_tx: Sender<Incoming>,
    event_rx: Receiver<Incoming>,
    subscriptions: Mutex<Vec<Arc<dyn Subscription>>>,
    handler: Arc<dyn EventHandler>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolEngine {
    /// Create an engine and start its event thread.
    ///
    /// `default_timeout` applies to every invocation that does not set its own.
    pub fn start(
        name: impl Into<String>,
        writer: Box<dyn LineWriter>,
        handler: Arc<dyn EventHandler>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let (response_tx, response_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        let engine = Arc::new(ProtocolEngine {
            name: name.into(),
            alive: AtomicBool::new(true),
            default_timeout,
            writer: Mutex::new(writer),
            response_tx,
            response_rx,
            event_tx,
            event_rx,
            subscriptions: Mutex::new(Vec::new()),
            handler,
            event_thread: Mutex::new(None),
        });

        let loop_engine = Arc::clone(&engine);
        let handle = thread::Builder::new()
            .name(format!("at-event-{}", engine.name))
            .spawn(move || loop_engine.run_event_loop())
            .expect("Failed to spawn event thread");
        *engine.event_thread.lock() = Some(handle);

        engine
    }

    /// Device name this engine serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the engine accepts commands.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Per-line timeout used when an invocation does not set one.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of subscriptions currently registered (active or awaiting compaction).
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Route one incoming line to the event or response queue.
    ///
    /// Must be called once per line, in arrival order.
    pub fn classify(&self, line: &str) {
        let (queue, kind) = if line.starts_with(EVENT_PREFIX) {
            (&self.event_tx, "event")
        } else {
            (&self.response_tx, "response")
        };
        trace!("Engine[{}]: {} line '{}'", self.name, kind, line);
        // Both receivers live in `self`, so the queues cannot disconnect.
        let _ = queue.send(Incoming::Line(line.to_string()));
    }

    /// Send a plain command with default tokens and timeout.
    pub fn command(&self, text: &str) -> AtResult<Vec<String>> {
        self.send_command(&Invocation::new(text))
    }

    /// Send a typed command with default tokens and timeout.
    pub fn execute(&self, cmd: &AtCommand) -> AtResult<Vec<String>> {
        self.send_command(&Invocation::from(cmd.clone()))
    }

    /// Send a command and wait for its terminal token.
    ///
    /// Returns the intermediate lines received before the success token.
    /// Blocks while another command is in flight. The timeout restarts with
    /// every received line.
    pub fn send_command(&self, invocation: &Invocation) -> AtResult<Vec<String>> {
        if !self.is_alive() {
            return Err(AtError::ChannelClosed);
        }
        let timeout = invocation.timeout.unwrap_or(self.default_timeout);

        let mut writer = self.writer.lock();

        // Replies to an earlier timed-out command must not leak into this one.
        while let Ok(stale) = self.response_rx.try_recv() {
            match stale {
                Incoming::Line(line) => {
                    warn!("Engine[{}]: discarding stale response '{}'", self.name, line);
                }
                Incoming::Closed => return Err(AtError::ChannelClosed),
            }
        }

        if let Some(subscription) = &invocation.subscription {
            self.subscriptions.lock().push(Arc::clone(subscription));
        }

        debug!("Engine[{}]: sending '{}'", self.name, invocation.text);
        if let Err(e) = writer.write_line(&invocation.text) {
            error!("Engine[{}]: write of '{}' failed: {}", self.name, invocation.text, e);
            return Err(AtError::ChannelClosed);
        }

        let mut lines = Vec::new();
        loop {
            match self.response_rx.recv_timeout(timeout) {
                Ok(Incoming::Line(line)) => {
                    if line == invocation.success_token {
                        trace!("Engine[{}]: '{}' -> {:?}", self.name, invocation.text, lines);
                        return Ok(lines);
                    }
                    if line == invocation.error_token {
                        return Err(AtError::Protocol {
                            command: invocation.text.clone(),
                            lines,
                        });
                    }
                    lines.push(line);
                }
                Ok(Incoming::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(AtError::ChannelClosed);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(AtError::CommandTimeout {
                        command: invocation.text.clone(),
                        timeout,
                        lines,
                    });
                }
            }
        }
    }

    /// Stop the event thread and abort the pending command, if any.
    pub fn stop(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            info!("Engine[{}]: stopping", self.name);
            let _ = self.event_tx.send(Incoming::Closed);
            let _ = self.response_tx.send(Incoming::Closed);
        }
    }

    /// Wait for the event thread to exit. Call after [`ProtocolEngine::stop`].
    ///
    /// Does nothing when called from the event thread itself.
    pub fn join(&self) {
        let handle = {
            let mut slot = self.event_thread.lock();
            match slot.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => return,
                _ => slot.take(),
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Engine[{}]: event thread panicked", self.name);
            }
        }
    }

    // ========================================================================
    // Event Thread
    // ========================================================================

    fn run_event_loop(&self) {
        debug!("Engine[{}]: event loop started", self.name);
        while self.is_alive() {
            match self.event_rx.recv() {
                Ok(Incoming::Line(line)) => self.dispatch(&line),
                Ok(Incoming::Closed) | Err(_) => break,
            }
        }
        debug!("Engine[{}]: event loop stopped", self.name);
    }

    fn dispatch(&self, line: &str) {
        info!("Engine[{}]: received event '{}'", self.name, line);
        let event = match Event::parse(line) {
            Ok(event) => event,
            Err(e) => {
                error!("Engine[{}]: {}", self.name, e);
                return;
            }
        };

        self.handler.handle_event(self, &event);

        // Deliver outside the list lock: subscriptions may issue commands,
        // which register subscriptions of their own.
        let active: Vec<Arc<dyn Subscription>> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        for subscription in &active {
            if subscription.is_active() {
                subscription.process(&event);
            }
        }

        self.subscriptions.lock().retain(|s| s.is_active());
    }
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockModem;
    use crate::subscription::{Delivery, OneShot};
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_millis(300);

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_command_returns_intermediate_lines() {
        let modem = MockModem::start("m", Arc::new(NoopHandler), TIMEOUT, |line: &str| {
            if line == "AT+CMGR=3" {
                vec!["+CMGR: 0,,23".to_string(), "0791".to_string(), "OK".to_string()]
            } else {
                vec!["OK".to_string()]
            }
        });

        // "+CMGR:" starts with '+', so it is routed to the event queue.
        let lines = modem.engine().command("AT+CMGR=3").unwrap();
        assert_eq!(lines, vec!["0791".to_string()]);
        assert_eq!(modem.written(), vec!["AT+CMGR=3".to_string()]);
    }

    #[test]
    fn test_error_token_carries_lines() {
        let modem = MockModem::start("m", Arc::new(NoopHandler), TIMEOUT, |_: &str| {
            vec!["partial".to_string(), "ERROR".to_string()]
        });

        let err = modem.engine().command("AT+CPMS=\"XX\"").unwrap_err();
        match err {
            AtError::Protocol { command, lines } => {
                assert_eq!(command, "AT+CPMS=\"XX\"");
                assert_eq!(lines, vec!["partial".to_string()]);
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_tokens() {
        let modem = MockModem::start("m", Arc::new(NoopHandler), TIMEOUT, |_: &str| {
            vec!["OK".to_string(), "DONE".to_string()]
        });

        let inv = Invocation::new("AT+X").with_tokens("DONE", "FAIL");
        let lines = modem.engine().send_command(&inv).unwrap();
        assert_eq!(lines, vec!["OK".to_string()]);
    }

    #[test]
    #[serial]
    fn test_timeout_reports_partial_lines() {
        let modem = MockModem::start("m", Arc::new(NoopHandler), TIMEOUT, |_: &str| {
            vec!["line1".to_string()]
        });

        let timeout = Duration::from_millis(150);
        let started = Instant::now();
        let err = modem
            .engine()
            .send_command(&Invocation::new("AT+SLOW").with_timeout(timeout))
            .unwrap_err();
        let elapsed = started.elapsed();

        match err {
            AtError::CommandTimeout { command, timeout: t, lines } => {
                assert_eq!(command, "AT+SLOW");
                assert_eq!(t, timeout);
                assert_eq!(lines, vec!["line1".to_string()]);
            }
            other => panic!("Expected CommandTimeout, got {:?}", other),
        }
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout * 5);
    }

    #[test]
    #[serial]
    fn test_timeout_is_per_line() {
        // Five lines 60ms apart, well over one 150ms budget in total.
        let modem = MockModem::start("m", Arc::new(NoopHandler), TIMEOUT, |_: &str| Vec::new());
        let engine = Arc::clone(modem.engine());
        let feeder = thread::spawn(move || {
            for i in 0..5 {
                thread::sleep(Duration::from_millis(60));
                engine.classify(&format!("line{}", i));
            }
            thread::sleep(Duration::from_millis(60));
            engine.classify("OK");
        });

        let lines = modem
            .engine()
            .send_command(&Invocation::new("AT+STREAM").with_timeout(Duration::from_millis(150)))
            .unwrap();
        feeder.join().unwrap();
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn test_stale_response_discarded() {
        let modem = MockModem::start("m", Arc::new(NoopHandler), TIMEOUT, |_: &str| {
            vec!["OK".to_string()]
        });

        // A late reply from some earlier command.
        modem.engine().classify("leftover");
        modem.engine().classify("OK");

        let lines = modem.engine().command("AT").unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    #[serial]
    fn test_commands_do_not_overlap() {
        let ok_sent_at: Arc<Mutex<Vec<(String, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let ok_log = ok_sent_at.clone();
        let modem = MockModem::start("m", Arc::new(NoopHandler), Duration::from_secs(2), move |line: &str| {
            thread::sleep(Duration::from_millis(80));
            ok_log.lock().push((line.to_string(), Instant::now()));
            vec!["OK".to_string()]
        });

        let mut callers = Vec::new();
        for name in ["AT+A", "AT+B"] {
            let engine = Arc::clone(modem.engine());
            callers.push(thread::spawn(move || engine.command(name).unwrap()));
        }
        for caller in callers {
            caller.join().unwrap();
        }

        let written = modem.written_with_times();
        let oks = ok_sent_at.lock().clone();
        assert_eq!(written.len(), 2);
        assert_eq!(oks.len(), 2);
        // The second write happens only after the first command's OK.
        assert_eq!(written[0].0, oks[0].0);
        assert!(written[1].1 >= oks[0].1);
    }

    #[test]
    fn test_stop_fails_pending_command() {
        let modem = MockModem::start("m", Arc::new(NoopHandler), Duration::from_secs(10), |_: &str| Vec::new());
        let engine = Arc::clone(modem.engine());
        let caller = thread::spawn(move || engine.command("AT+HANG"));

        assert!(wait_until(|| modem.written().len() == 1));
        modem.engine().stop();

        assert_eq!(caller.join().unwrap(), Err(AtError::ChannelClosed));
        assert_eq!(modem.engine().command("AT"), Err(AtError::ChannelClosed));
        assert!(!modem.engine().is_alive());
        modem.engine().join();
    }

    struct CountingHandler {
        names: Mutex<Vec<String>>,
    }

    impl EventHandler for CountingHandler {
        fn handle_event(&self, _engine: &ProtocolEngine, event: &Event) {
            self.names.lock().push(event.name().to_string());
        }
    }

    #[test]
    fn test_events_reach_handler_in_order() {
        let handler = Arc::new(CountingHandler { names: Mutex::new(Vec::new()) });
        let modem = MockModem::start("m", handler.clone(), TIMEOUT, |_: &str| Vec::new());

        modem.inject("+CREG: 1");
        modem.inject("no colon here but plus"); // response queue, never parsed
        modem.inject("+BROKEN");
        modem.inject("+CMTI: \"SM\",2");

        assert!(wait_until(|| handler.names.lock().len() == 2));
        assert_eq!(*handler.names.lock(), vec!["+CREG".to_string(), "+CMTI".to_string()]);
    }

    #[test]
    fn test_subscription_sees_event_after_handler_and_only_once() {
        let handler = Arc::new(CountingHandler { names: Mutex::new(Vec::new()) });
        let handler_seen_first = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let modem = MockModem::start("m", handler.clone(), TIMEOUT, |line: &str| {
            if line.starts_with("AT+CUSD=1") {
                vec!["OK".to_string(), "+CUSD: 0,\"Balance: 10\",15".to_string()]
            } else {
                vec!["OK".to_string()]
            }
        });

        let seen = handler_seen_first.clone();
        let counter = calls.clone();
        let handler_ref = handler.clone();
        let sub: Arc<dyn Subscription> = Arc::new(OneShot::new("+CUSD", move |event: &Event| {
            seen.store(handler_ref.names.lock().contains(&"+CUSD".to_string()), Ordering::SeqCst);
            assert_eq!(event.expect_str(1).unwrap(), "Balance: 10");
            counter.fetch_add(1, Ordering::SeqCst);
            Delivery::Consumed
        }));

        let inv = Invocation::from(AtCommand::UssdRequest { code: "*100#".to_string() }).subscribe(sub.clone());
        modem.engine().send_command(&inv).unwrap();

        assert!(wait_until(|| !sub.is_active()));
        modem.inject("+CUSD: 0,\"Balance: 11\",15");
        assert!(wait_until(|| handler.names.lock().len() == 2));
        assert!(wait_until(|| modem.engine().subscription_count() == 0));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handler_seen_first.load(Ordering::SeqCst));
    }

    #[test]
    fn test_subscription_may_issue_commands() {
        let modem = MockModem::start("m", Arc::new(NoopHandler), TIMEOUT, |line: &str| {
            if line.starts_with("AT+CUSD=1") {
                vec!["OK".to_string(), "+CUSD: 1,\"Menu\",15".to_string()]
            } else {
                vec!["OK".to_string()]
            }
        });

        let weak = Arc::downgrade(modem.engine());
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = closed.clone();
        let sub: Arc<dyn Subscription> = Arc::new(OneShot::new("+CUSD", move |_: &Event| {
            if let Some(engine) = weak.upgrade() {
                closed_flag.store(engine.execute(&AtCommand::UssdCancel).is_ok(), Ordering::SeqCst);
            }
            Delivery::Consumed
        }));

        modem
            .engine()
            .send_command(&Invocation::new("AT+CUSD=1,\"*100#\",15").subscribe(sub))
            .unwrap();

        assert!(wait_until(|| closed.load(Ordering::SeqCst)));
        assert_eq!(modem.written().last().map(String::as_str), Some("AT+CUSD=2"));
    }
}
