//! Incoming SMS retrieval and forwarding.
//!
//! On `+CMTI: "<storage>",<index>` the [`SmsPipeline`] (the engine's event
//! handler) selects the storage, reads the message, decodes the PDU and
//! queues the resulting [`SmsRecord`]. A per-device worker thread drains the
//! queue into an [`SmsHandler`], normally an [`SmsForwarder`].
//!
//! Retrieval runs synchronously on the engine's event thread. Any failure
//! abandons that one notification; nothing is retried.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, FixedOffset};
use crossbeam_channel::{Receiver, Sender};
use smser_at::{AtCommand, Event, EventHandler, ProtocolEngine, EVENT_MESSAGE_INDICATION};
use smser_pdu::{ConcatInfo, DeliverPdu, PduResult};
use tracing::{debug, error, info};

use crate::courier::{Courier, PendingMessage};

/// Timestamp format used in forwarded messages.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Lines expected from a message read: the echoed command and the PDU.
const READ_LINE_COUNT: usize = 2;

/// PDU decoding function.
pub type PduDecoder = fn(&str) -> PduResult<DeliverPdu>;

/// A retrieved and decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct SmsRecord {
    /// Storage area the message was read from.
    pub storage: String,
    /// Index within the storage area.
    pub index: u32,
    /// Originating address.
    pub sender: String,
    /// Service centre timestamp.
    pub timestamp: DateTime<FixedOffset>,
    /// Message text.
    pub body: String,
    /// Set when this is one part of a concatenated message.
    pub partial: Option<ConcatInfo>,
}

impl SmsRecord {
    /// Build a record from a decoded PDU.
    pub fn from_pdu(pdu: DeliverPdu, storage: &str, index: u32) -> Self {
        SmsRecord {
            storage: storage.to_string(),
            index,
            sender: pdu.sender,
            timestamp: pdu.timestamp,
            body: pdu.body,
            partial: pdu.partial,
        }
    }

    /// Whether this is one part of a concatenated message.
    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }
}

/// Item on the per-device SMS queue.
#[derive(Debug)]
pub enum SmsJob {
    /// A message to hand to the handler.
    Deliver(SmsRecord),
    /// Stop the worker after everything queued before it.
    Shutdown,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Event handler retrieving messages announced by `+CMTI`.
pub struct SmsPipeline {
    device: String,
    decoder: PduDecoder,
    queue: Sender<SmsJob>,
}

impl SmsPipeline {
    /// Create a pipeline feeding `queue`.
    pub fn new(device: impl Into<String>, queue: Sender<SmsJob>) -> Self {
        SmsPipeline {
            device: device.into(),
            decoder: smser_pdu::decode_deliver,
            queue,
        }
    }

    /// Replace the PDU decoder.
    pub fn with_decoder(mut self, decoder: PduDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Select `storage`, read message `index` and decode it.
    ///
    /// Returns `None` (after logging) when any step fails.
    pub fn retrieve(&self, engine: &ProtocolEngine, storage: &str, index: u32) -> Option<SmsRecord> {
        let select = AtCommand::SelectStorage {
            area: storage.to_string(),
        };
        if let Err(e) = engine.execute(&select) {
            error!("SmsPipeline[{}]: failed to select storage {}: {}", self.device, storage, e);
            return None;
        }

        let lines: Vec<String> = match engine.execute(&AtCommand::ReadMessage { index }) {
            Ok(lines) => lines
                .into_iter()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            Err(e) => {
                error!("SmsPipeline[{}]: failed to read message {}: {}", self.device, index, e);
                return None;
            }
        };
        if lines.len() != READ_LINE_COUNT {
            error!(
                "SmsPipeline[{}]: wrong number of lines reading message {}: {:?} ({} expected)",
                self.device, index, lines, READ_LINE_COUNT
            );
            return None;
        }

        match (self.decoder)(&lines[1]) {
            Ok(pdu) => Some(SmsRecord::from_pdu(pdu, storage, index)),
            Err(e) => {
                error!("SmsPipeline[{}]: failed to decode message {} ({:?}): {}", self.device, index, lines, e);
                None
            }
        }
    }
}

impl EventHandler for SmsPipeline {
    fn handle_event(&self, engine: &ProtocolEngine, event: &Event) {
        if event.name() != EVENT_MESSAGE_INDICATION {
            return;
        }

        let storage = match event.expect_str(0) {
            Ok(storage) => storage,
            Err(e) => {
                error!("SmsPipeline[{}]: {}", self.device, e);
                return;
            }
        };
        let index = match event.expect_int(1).map(u32::try_from) {
            Ok(Ok(index)) => index,
            Ok(Err(_)) => {
                error!("SmsPipeline[{}]: message index out of range in {}", self.device, event);
                return;
            }
            Err(e) => {
                error!("SmsPipeline[{}]: {}", self.device, e);
                return;
            }
        };

        if let Some(sms) = self.retrieve(engine, storage, index) {
            debug!("SmsPipeline[{}]: queued message {} from {}", self.device, index, sms.sender);
            if self.queue.send(SmsJob::Deliver(sms)).is_err() {
                error!("SmsPipeline[{}]: SMS worker is gone, message {} dropped", self.device, index);
            }
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Consumer of retrieved messages.
pub trait SmsHandler: Send + Sync {
    /// Handle one message.
    fn handle_sms(&self, sms: &SmsRecord);
}

/// Start the worker draining `queue` into `handler`.
///
/// The worker exits on [`SmsJob::Shutdown`] or when every sender is gone.
pub fn spawn_sms_worker(device: &str, queue: Receiver<SmsJob>, handler: Arc<dyn SmsHandler>) -> JoinHandle<()> {
    let device = device.to_string();
    thread::Builder::new()
        .name(format!("at-sms-{}", device))
        .spawn(move || {
            for job in queue.iter() {
                match job {
                    SmsJob::Deliver(sms) => handler.handle_sms(&sms),
                    SmsJob::Shutdown => break,
                }
            }
            debug!("SmsWorker[{}]: stopped", device);
        })
        .expect("Failed to spawn SMS worker thread")
}

/// Handler forwarding every message to the device's recipients.
pub struct SmsForwarder {
    device: String,
    targets: Vec<String>,
    courier: Arc<Courier>,
}

impl SmsForwarder {
    /// Create a forwarder for one device.
    pub fn new(device: impl Into<String>, targets: Vec<String>, courier: Arc<Courier>) -> Self {
        SmsForwarder {
            device: device.into(),
            targets,
            courier,
        }
    }
}

impl SmsHandler for SmsForwarder {
    fn handle_sms(&self, sms: &SmsRecord) {
        info!(
            "SmsForwarder[{}]: message from {} at {}, sending to {:?}",
            self.device, sms.sender, sms.timestamp, self.targets
        );
        let text = format_sms(&self.device, sms);
        for target in &self.targets {
            self.courier.deliver(PendingMessage {
                target: target.clone(),
                text: text.clone(),
                description: format!("SMS {} from {} on {}", sms.index, sms.sender, self.device),
            });
        }
    }
}

/// Text of a forwarded message.
pub fn format_sms(device: &str, sms: &SmsRecord) -> String {
    format!(
        "SMS to {} from {} at {}:\n{}",
        device,
        sms.sender,
        sms.timestamp.format(TIMESTAMP_FORMAT),
        sms.body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::courier::tests::RecordingSink;
    use chrono::TimeZone;
    use smser_at::mock::MockModem;
    use smser_pdu::PduError;
    use std::time::Duration;

    const HELLO_PDU: &str = "07917283010010F5040BC87238880900F10000993092516195800AE8329BFD4697D9EC37";
    const TIMEOUT: Duration = Duration::from_millis(300);

    fn modem_responder(read_reply: Vec<&'static str>) -> impl FnMut(&str) -> Vec<String> + Send + 'static {
        move |line: &str| {
            if line.starts_with("AT+CMGR=") {
                read_reply.iter().map(|s| s.to_string()).collect()
            } else {
                vec!["OK".to_string()]
            }
        }
    }

    fn started(read_reply: Vec<&'static str>) -> (MockModem, Receiver<SmsJob>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let pipeline = Arc::new(SmsPipeline::new("modem1", tx));
        let modem = MockModem::start("modem1", pipeline, TIMEOUT, modem_responder(read_reply));
        (modem, rx)
    }

    #[test]
    fn test_cmti_retrieves_message() {
        let (modem, rx) = started(vec!["AT+CMGR=3", "+CMGR: 0,,23", HELLO_PDU, "OK"]);

        modem.inject("+CMTI: \"ME\",3");
        let job = rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert_eq!(modem.written(), vec!["AT+CPMS=\"ME\"".to_string(), "AT+CMGR=3".to_string()]);
        match job {
            SmsJob::Deliver(sms) => {
                assert_eq!(sms.storage, "ME");
                assert_eq!(sms.index, 3);
                assert_eq!(sms.sender, "27838890001");
                assert_eq!(sms.body, "hellohello");
                assert!(!sms.is_partial());
            }
            other => panic!("Expected Deliver, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_line_count_abandons() {
        // Echo disabled: only the PDU line reaches the response stream.
        let (modem, rx) = started(vec!["+CMGR: 0,,23", HELLO_PDU, "OK"]);

        modem.inject("+CMTI: \"SM\",1");
        assert!(modem.wait_for_writes(2, Duration::from_secs(2)));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        // The engine keeps serving later notifications.
        assert!(modem.engine().is_alive());
        assert_eq!(modem.engine().command("AT"), Ok(Vec::new()));
    }

    #[test]
    fn test_blank_lines_ignored_in_count() {
        let (modem, rx) = started(vec!["AT+CMGR=2", "   ", HELLO_PDU, "OK"]);
        modem.inject("+CMTI: \"SM\",2");
        assert!(matches!(rx.recv_timeout(Duration::from_secs(2)), Ok(SmsJob::Deliver(_))));
    }

    #[test]
    fn test_storage_error_abandons_before_read() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let pipeline = Arc::new(SmsPipeline::new("modem1", tx));
        let modem = MockModem::start("modem1", pipeline, TIMEOUT, |line: &str| {
            if line.starts_with("AT+CPMS") {
                vec!["ERROR".to_string()]
            } else {
                vec!["OK".to_string()]
            }
        });

        modem.inject("+CMTI: \"XX\",1");
        assert!(modem.wait_for_writes(1, Duration::from_secs(2)));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(modem.written(), vec!["AT+CPMS=\"XX\"".to_string()]);
    }

    #[test]
    fn test_decode_failure_abandons() {
        fn failing(_: &str) -> PduResult<DeliverPdu> {
            Err(PduError::InvalidUcs2)
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let pipeline = Arc::new(SmsPipeline::new("modem1", tx).with_decoder(failing));
        let modem = MockModem::start(
            "modem1",
            pipeline,
            TIMEOUT,
            modem_responder(vec!["AT+CMGR=1", HELLO_PDU, "OK"]),
        );

        modem.inject("+CMTI: \"SM\",1");
        assert!(modem.wait_for_writes(2, Duration::from_secs(2)));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_malformed_indication_ignored() {
        let (modem, rx) = started(vec![]);
        modem.inject("+CMTI: 3,\"ME\"");
        modem.inject("+CREG: 1");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(modem.written().is_empty());
    }

    fn record() -> SmsRecord {
        SmsRecord {
            storage: "SM".to_string(),
            index: 4,
            sender: "+79161234567".to_string(),
            timestamp: FixedOffset::east_opt(3 * 3600)
                .unwrap()
                .with_ymd_and_hms(2024, 5, 17, 9, 30, 15)
                .unwrap(),
            body: "Code: 1234".to_string(),
            partial: None,
        }
    }

    #[test]
    fn test_format_sms() {
        assert_eq!(
            format_sms("modem1", &record()),
            "SMS to modem1 from +79161234567 at 2024-05-17 09:30:15:\nCode: 1234"
        );
    }

    #[test]
    fn test_worker_forwards_to_every_target() {
        let sink = Arc::new(RecordingSink::default());
        let courier = Arc::new(Courier::new(sink.clone()));
        let forwarder = Arc::new(SmsForwarder::new(
            "modem1",
            vec!["1".to_string(), "2".to_string()],
            courier,
        ));

        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = spawn_sms_worker("modem1", rx, forwarder);
        tx.send(SmsJob::Deliver(record())).unwrap();
        tx.send(SmsJob::Shutdown).unwrap();
        worker.join().unwrap();

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "1");
        assert_eq!(sent[1].0, "2");
        assert!(sent[0].1.starts_with("SMS to modem1 from +79161234567"));
    }

    #[test]
    fn test_forwarder_failure_goes_to_retry_queue() {
        let sink = Arc::new(RecordingSink::default());
        sink.failing.store(true, std::sync::atomic::Ordering::SeqCst);
        let courier = Arc::new(Courier::new(sink));
        let forwarder = SmsForwarder::new("modem1", vec!["1".to_string()], courier.clone());

        forwarder.handle_sms(&record());
        assert_eq!(courier.pending(), 1);
    }
}
