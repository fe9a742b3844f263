//! Scripted in-process modem for tests.
//!
//! [`MockModem`] starts a [`ProtocolEngine`] whose writer feeds a responder
//! closure on its own thread. Every line the responder returns is classified
//! back into the engine in order, exactly as a reader thread would.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::engine::{EventHandler, ProtocolEngine};
use crate::transport::LineWriter;

type WriteLog = Arc<Mutex<Vec<(String, Instant)>>>;

struct ChannelWriter {
    tx: Sender<String>,
    log: WriteLog,
}

impl LineWriter for ChannelWriter {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.log.lock().push((line.to_string(), Instant::now()));
        self.tx
            .send(line.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock modem gone"))
    }
}

/// Loopback modem driving a real [`ProtocolEngine`].
pub struct MockModem {
    engine: Arc<ProtocolEngine>,
    log: WriteLog,
}

impl MockModem {
    /// Start an engine whose written commands are answered by `responder`.
    pub fn start<R>(
        name: &str,
        handler: Arc<dyn EventHandler>,
        default_timeout: Duration,
        responder: R,
    ) -> MockModem
    where
        R: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded::<String>();
        let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
        let writer = ChannelWriter {
            tx,
            log: log.clone(),
        };
        let engine = ProtocolEngine::start(name, Box::new(writer), handler, default_timeout);

        let weak = Arc::downgrade(&engine);
        let mut responder = responder;
        thread::Builder::new()
            .name(format!("mock-modem-{}", name))
            .spawn(move || {
                for line in rx.iter() {
                    let replies = responder(&line);
                    let Some(engine) = weak.upgrade() else {
                        break;
                    };
                    for reply in replies {
                        engine.classify(&reply);
                    }
                }
            })
            .expect("Failed to spawn mock modem thread");

        MockModem { engine, log }
    }

    /// The engine under test.
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Feed one line as if the modem sent it unprompted.
    pub fn inject(&self, line: &str) {
        self.engine.classify(line);
    }

    /// Lines written so far.
    pub fn written(&self) -> Vec<String> {
        self.log.lock().iter().map(|(line, _)| line.clone()).collect()
    }

    /// Lines written so far, with the time each write happened.
    pub fn written_with_times(&self) -> Vec<(String, Instant)> {
        self.log.lock().clone()
    }

    /// Poll until at least `count` lines were written or `timeout` passes.
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.log.lock().len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for MockModem {
    fn drop(&mut self) {
        self.engine.stop();
    }
}
