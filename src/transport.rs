//! Byte-level transport to the adapter
//!
//! An ELM327 speaks a line-oriented ASCII dialect: the tester sends a
//! command terminated by a carriage return, the adapter answers with one or
//! more CR/LF separated lines and finally a `>` prompt. The transport layer
//! owns exactly that framing and nothing else; it never interprets the
//! bytes it carries.

use std::{
    io::{ErrorKind, Read, Write},
    sync::Arc,
    time::{Duration, Instant},
};

use serial_rs::SerialPort;

/// Transport operation result
pub type TransportResult<T> = Result<T, TransportError>;

/// Default deadline for a read-until-prompt cycle
pub const DEFAULT_READ_DEADLINE: Duration = Duration::from_millis(2000);

/// Upper bound a caller may stretch the deadline to (slow services 0x19/0x14)
pub const MAX_READ_DEADLINE: Duration = Duration::from_millis(5000);

/// Sleep interval while the channel signals no bytes available
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Error produced by the byte transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Underlying channel read/write failure
    #[error("IO error")]
    Io(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
    /// The prompt character was not seen within the deadline
    #[error("no prompt within read deadline")]
    ReadTimeout,
    /// The port was closed underneath us
    #[error("port closed")]
    PortClosed,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

/// A duplex channel speaking the ELM prompt framing.
///
/// Implementors carry raw bytes only. [SerialPortTransport] is the real
/// thing; tests inject a scripted double.
pub trait PromptTransport: Send {
    /// Writes `cmd` followed by a carriage return and flushes the channel.
    fn write_line(&mut self, cmd: &str) -> TransportResult<()>;

    /// Accumulates bytes until the `>` prompt is observed or `deadline`
    /// elapses. The prompt itself is excluded from the returned buffer.
    fn read_until_prompt(&mut self, deadline: Duration) -> TransportResult<Vec<u8>>;

    /// Closes the channel. Further calls fail with [TransportError::PortClosed].
    fn close(&mut self);
}

/// [PromptTransport] over a serial port (USB or Bluetooth SPP)
pub struct SerialPortTransport {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortTransport {
    /// Wraps an already-opened serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port: Some(port) }
    }

    fn port_mut(&mut self) -> TransportResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(TransportError::PortClosed)
    }
}

impl PromptTransport for SerialPortTransport {
    fn write_line(&mut self, cmd: &str) -> TransportResult<()> {
        let port = self.port_mut()?;
        port.write_all(cmd.as_bytes())?;
        port.write_all(b"\r")?;
        port.flush()?;
        Ok(())
    }

    fn read_until_prompt(&mut self, deadline: Duration) -> TransportResult<Vec<u8>> {
        let start = Instant::now();
        let mut buf: Vec<u8> = Vec::with_capacity(64);
        let mut byte = [0u8; 1];
        let port = self.port_mut()?;
        loop {
            match port.read(&mut byte) {
                Ok(1) => {
                    if byte[0] == b'>' {
                        return Ok(buf);
                    }
                    buf.push(byte[0]);
                }
                Ok(_) => {
                    if start.elapsed() >= deadline {
                        return Err(TransportError::ReadTimeout);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    if start.elapsed() >= deadline {
                        return Err(TransportError::ReadTimeout);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) {
        self.port = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Transport double that drips queued chunks one read at a time
    struct DripTransport {
        chunks: VecDeque<Vec<u8>>,
        current: VecDeque<u8>,
    }

    impl DripTransport {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
                current: VecDeque::new(),
            }
        }
    }

    impl PromptTransport for DripTransport {
        fn write_line(&mut self, _cmd: &str) -> TransportResult<()> {
            Ok(())
        }

        fn read_until_prompt(&mut self, deadline: Duration) -> TransportResult<Vec<u8>> {
            // Same accumulation loop as the serial implementation, driven by
            // the queued chunks instead of a port.
            let start = Instant::now();
            let mut buf = Vec::new();
            loop {
                if let Some(b) = self.current.pop_front() {
                    if b == b'>' {
                        return Ok(buf);
                    }
                    buf.push(b);
                    continue;
                }
                match self.chunks.pop_front() {
                    Some(next) => self.current = next.into(),
                    None => {
                        if start.elapsed() >= deadline {
                            return Err(TransportError::ReadTimeout);
                        }
                    }
                }
            }
        }

        fn close(&mut self) {}
    }

    #[test]
    fn prompt_terminates_and_is_excluded() {
        let mut t = DripTransport::new(&[b"41 0", b"0 BE 3F", b"\r>"]);
        let out = t.read_until_prompt(Duration::from_millis(50)).unwrap();
        assert_eq!(out, b"41 00 BE 3F\r");
    }

    #[test]
    fn missing_prompt_times_out() {
        let mut t = DripTransport::new(&[b"41 00"]);
        let res = t.read_until_prompt(Duration::from_millis(20));
        assert!(matches!(res, Err(TransportError::ReadTimeout)));
    }
}
