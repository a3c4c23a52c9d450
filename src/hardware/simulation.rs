//! Scripted adapter for unit and integration testing
//!
//! Plays the role of an ELM327: commands written to it are answered from a
//! request→reply map, and everything written is recorded so tests can
//! assert on the exact command sequence the controller emitted.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::transport::{PromptTransport, TransportError, TransportResult};

/// Shared recorder of every command line written to the scripted adapter
pub type SentLog = Arc<Mutex<Vec<String>>>;

/// [PromptTransport] double answering from a canned script.
///
/// Replies are stored WITHOUT the trailing prompt; unknown commands answer
/// `OK` like a permissive clone. Map an explicit `NO DATA` (or any other
/// text) to exercise failure paths.
pub struct ScriptedTransport {
    replies: HashMap<String, String>,
    pending: Option<String>,
    sent: SentLog,
    closed: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            pending: None,
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Scripts the reply for one exact command (compared upper-cased)
    pub fn on(mut self, cmd: &str, reply: &str) -> Self {
        self.replies.insert(cmd.to_uppercase(), reply.to_string());
        self
    }

    /// Handle to the recorded command log
    pub fn sent_log(&self) -> SentLog {
        self.sent.clone()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptTransport for ScriptedTransport {
    fn write_line(&mut self, cmd: &str) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::PortClosed);
        }
        let cmd = cmd.trim().to_uppercase();
        self.sent.lock().unwrap().push(cmd.clone());
        let reply = match self.replies.get(&cmd) {
            Some(r) => r.clone(),
            None if cmd.starts_with("AT") => "OK".to_string(),
            None => "NO DATA".to_string(),
        };
        self.pending = Some(reply);
        Ok(())
    }

    fn read_until_prompt(&mut self, _deadline: Duration) -> TransportResult<Vec<u8>> {
        if self.closed {
            return Err(TransportError::PortClosed);
        }
        match self.pending.take() {
            Some(r) => Ok(format!("{r}\r").into_bytes()),
            None => Err(TransportError::ReadTimeout),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Convenience: the command log as plain strings
pub fn drain_log(log: &SentLog) -> Vec<String> {
    log.lock().unwrap().drain(..).collect()
}
