//! Modem byte channels.
//!
//! A locator is either `socket://host:port` (a TCP serial bridge) or the
//! path of a serial port, opened at the configured baud rate.

use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use smser_at::{LineCodec, LineWriter, ProtocolEngine, StreamWriter};
use tracing::{debug, error, info, warn};

/// Locator prefix selecting a TCP connection.
pub const SOCKET_SCHEME: &str = "socket://";

/// Read buffer size of the reader thread.
const READ_CHUNK: usize = 256;

/// Longest a serial read blocks before the reader re-checks the engine.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Both directions of an opened modem channel.
pub struct Transport {
    /// Incoming bytes.
    pub reader: Box<dyn Read + Send>,
    /// Outgoing lines.
    pub writer: Box<dyn LineWriter>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Open the channel named by `locator`.
pub fn open_transport(locator: &str, baudrate: u32) -> io::Result<Transport> {
    if let Some(addr) = locator.strip_prefix(SOCKET_SCHEME) {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        info!("Transport: connected to {}", addr);
        return Ok(Transport {
            reader: Box::new(reader),
            writer: Box::new(StreamWriter::new(stream)),
        });
    }

    let port = serialport::new(locator, baudrate)
        .timeout(SERIAL_READ_TIMEOUT)
        .open()?;
    let reader = port.try_clone()?;
    info!("Transport: opened {} at {} baud", locator, baudrate);
    Ok(Transport {
        reader: Box::new(reader),
        writer: Box::new(StreamWriter::new(port)),
    })
}

/// Start the thread feeding every received line into `engine`.
///
/// On end of stream or a read error the engine is stopped, so pending and
/// later commands fail with `ChannelClosed`.
pub fn spawn_reader(name: &str, mut reader: Box<dyn Read + Send>, engine: Arc<ProtocolEngine>) -> JoinHandle<()> {
    let name = name.to_string();
    thread::Builder::new()
        .name(format!("at-reader-{}", name))
        .spawn(move || {
            let mut codec = LineCodec::new();
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        warn!("Reader[{}]: end of stream", name);
                        break;
                    }
                    Ok(n) => {
                        codec.push(&buf[..n]);
                        while let Some(line) = codec.decode_line() {
                            engine.classify(&line);
                        }
                    }
                    // Idle serial port; fall through to the liveness check.
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) => {}
                    Err(e) => {
                        error!("Reader[{}]: read failed: {}", name, e);
                        break;
                    }
                }
                if !engine.is_alive() {
                    break;
                }
            }
            engine.stop();
            debug!("Reader[{}]: stopped", name);
        })
        .expect("Failed to spawn reader thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use smser_at::mock::MockModem;
    use smser_at::{Event, EventHandler};
    use std::io::{BufRead, BufReader, Cursor, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    #[derive(Default)]
    struct Names(Mutex<Vec<String>>);

    impl EventHandler for Names {
        fn handle_event(&self, _engine: &ProtocolEngine, event: &Event) {
            self.0.lock().push(event.name().to_string());
        }
    }

    #[test]
    fn test_reader_classifies_then_stops_engine_on_eof() {
        let names = Arc::new(Names::default());
        let modem = MockModem::start("m", names.clone(), Duration::from_millis(200), |_: &str| Vec::new());

        let bytes = b"\r\n+CMTI: \"SM\",1\r\n+CREG: 1\n".to_vec();
        let handle = spawn_reader("m", Box::new(Cursor::new(bytes)), Arc::clone(modem.engine()));
        handle.join().unwrap();
        modem.engine().join();

        assert!(!modem.engine().is_alive());
        assert_eq!(*names.0.lock(), vec!["+CMTI".to_string(), "+CREG".to_string()]);
    }

    /// Times out on every read, like an idle serial port.
    struct IdlePort;

    impl Read for IdlePort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(10));
            Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
        }
    }

    #[test]
    fn test_reader_exits_after_engine_stops_on_idle_port() {
        let modem = MockModem::start("m", Arc::new(smser_at::NoopHandler), Duration::from_millis(200), |_: &str| {
            Vec::new()
        });
        let handle = spawn_reader("m", Box::new(IdlePort), Arc::clone(modem.engine()));

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        modem.engine().stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_socket_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut lines = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            lines.read_line(&mut line).unwrap();
            let mut out = stream;
            out.write_all(b"OK\r\n").unwrap();
            line
        });

        let mut transport = open_transport(&format!("socket://{}", addr), 115_200).unwrap();
        transport.writer.write_line("AT").unwrap();
        assert_eq!(server.join().unwrap(), "AT\r\n");

        let mut buf = [0u8; 4];
        transport.reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"OK\r\n");
    }

    #[test]
    fn test_missing_device_fails() {
        assert!(open_transport("/nonexistent/ttyUSB9", 115_200).is_err());
    }
}
