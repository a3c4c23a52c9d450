//! Adapter controller: configuration state, the exchange gate and the
//! broadcast rewrite
//!
//! Clone ELM327 silicon silently drops any frame transmitted with a
//! physical source header. The controller therefore never lets `ATSH` with
//! a physical id reach the wire: it rewrites the request into an equivalent
//! broadcast-plus-receive-filter sequence (`ATCRA`, `ATFCSH`, `ATFCSD`,
//! `ATFCSM`, `ATSH7DF`). The rewrite lives here and only here; no higher
//! layer can bypass it because this module is the only point of contact
//! with the transport.
//!
//! Every interaction is serialized through one owned worker thread that
//! services a request queue. The queue is the gate: requests execute one at
//! a time in submission order, and a multi-command rewrite is a single
//! request, atomic from the outside.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{
    catalog::{self, EcuAddress},
    hardware::{DeviceRef, TransportOpener},
    transport::{PromptTransport, TransportError, DEFAULT_READ_DEADLINE, MAX_READ_DEADLINE},
};

/// Adapter operation result
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Error produced by the adapter controller
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// Underlying transport failure
    #[error("transport failure")]
    Transport(
        #[from]
        #[source]
        TransportError,
    ),
    /// The `0100` probe yielded no usable reply
    #[error("CAN bus probe failed")]
    BusProbeFailed,
    /// The adapter answered `ERROR` or `?` to a configuration command
    #[error("adapter rejected '{0}'")]
    AdapterRejected(String),
    /// Destructive command refused because the CAN bus is already active
    #[error("'{0}' is forbidden once the bus is active")]
    ForbiddenAfterBusActive(String),
    /// No connection is established
    #[error("not connected")]
    NotConnected,
    /// The worker servicing the adapter has shut down
    #[error("adapter worker shut down")]
    Shutdown,
}

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Initializing,
    Ready,
    Errored,
}

/// Transmit header currently programmed into the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    /// Nothing programmed yet (fresh adapter)
    Unset,
    /// `ATSH7DF`; the only mode ever programmed once the bus is active
    Broadcast,
}

/// Configuration the adapter is currently known to hold
#[derive(Debug, Clone)]
pub struct AdapterState {
    pub phase: Phase,
    pub header_mode: HeaderMode,
    /// Last `ATCRA` value
    pub rx_filter: Option<u16>,
    /// Last `ATFCSH` value
    pub flow_control_header: Option<u16>,
    pub echo: bool,
    pub linefeed: bool,
    pub headers_shown: bool,
    pub spaces_shown: bool,
    pub can_bus_active: bool,
    /// Version line extracted from the `ATZ` banner
    pub version: Option<String>,
}

impl Default for AdapterState {
    fn default() -> Self {
        Self {
            phase: Phase::Disconnected,
            header_mode: HeaderMode::Unset,
            rx_filter: None,
            flow_control_header: None,
            echo: true,
            linefeed: true,
            headers_shown: false,
            spaces_shown: false,
            can_bus_active: false,
            version: None,
        }
    }
}

/// Injected observer sinks. Strictly unidirectional outputs.
#[derive(Default)]
pub struct AdapterHooks {
    pub on_state_changed: Option<Box<dyn Fn(Phase) + Send>>,
    pub on_log: Option<Box<dyn Fn(&str) + Send>>,
}

/// Timing knobs; the defaults match what clone adapters tolerate
#[derive(Debug, Clone, Copy)]
pub struct AdapterOptions {
    /// Settle time after `ATZ`
    pub reset_settle: Duration,
    /// Pause between initialization steps
    pub init_step_delay: Duration,
    /// Pause between pre-commands of a payload send
    pub pre_command_delay: Duration,
    /// Read deadline when the caller does not override it
    pub read_deadline: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            reset_settle: Duration::from_millis(1000),
            init_step_delay: Duration::from_millis(100),
            pre_command_delay: Duration::from_millis(50),
            read_deadline: DEFAULT_READ_DEADLINE,
        }
    }
}

/// Commands that visibly break communication on clones once CAN is active
const FORBIDDEN_AFTER_BUS_ACTIVE: &[&str] = &["ATZ", "ATD", "ATWS", "ATH0", "ATS0"];

/// One queued unit of adapter work. The embedded sender is the reply path;
/// dropping it is how a dead worker signals [AdapterError::Shutdown].
enum Request {
    Exchange {
        cmd: String,
        deadline: Duration,
        resp: mpsc::Sender<AdapterResult<String>>,
    },
    SelectEcu {
        tx: u16,
        rx: u16,
        resp: mpsc::Sender<AdapterResult<()>>,
    },
    SendPayload {
        payload: String,
        pre: Vec<String>,
        deadline: Duration,
        resp: mpsc::Sender<AdapterResult<String>>,
    },
    Snapshot {
        resp: mpsc::Sender<AdapterState>,
    },
    Shutdown {
        resp: mpsc::Sender<()>,
    },
}

/// Cloneable handle submitting requests through the gate.
///
/// Everything that talks to the adapter (UDS client, KWP client, the
/// TesterPresent keep-alive) holds one of these; the queue behind it
/// guarantees mutual exclusion.
#[derive(Clone)]
pub struct AdapterLink {
    queue: mpsc::Sender<Request>,
    running: Arc<AtomicBool>,
}

impl AdapterLink {
    fn submit<T>(&self, build: impl FnOnce(mpsc::Sender<AdapterResult<T>>) -> Request) -> AdapterResult<T> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(AdapterError::Shutdown);
        }
        let (tx, rx) = mpsc::channel();
        self.queue
            .send(build(tx))
            .map_err(|_| AdapterError::Shutdown)?;
        rx.recv().map_err(|_| AdapterError::Shutdown)?
    }

    /// Sends one command through the gate and returns the cleaned reply.
    /// `deadline` caps the read; `None` uses the configured default.
    pub fn exchange(&self, cmd: &str, deadline: Option<Duration>) -> AdapterResult<String> {
        let deadline = deadline.unwrap_or(DEFAULT_READ_DEADLINE).min(MAX_READ_DEADLINE);
        self.submit(|resp| Request::Exchange {
            cmd: cmd.to_string(),
            deadline,
            resp,
        })
    }

    /// Programs the receive filter and flow control for `(tx, rx)` and
    /// leaves the transmit header on broadcast. No-op when already set.
    pub fn select_ecu(&self, tx: u16, rx: u16) -> AdapterResult<()> {
        self.submit(|resp| Request::SelectEcu { tx, rx, resp })
    }

    /// Runs `pre` commands (the broadcast rewrite applies to each), then
    /// sends the payload line and returns its cleaned reply.
    pub fn send_payload(
        &self,
        payload: &str,
        pre: &[&str],
        deadline: Option<Duration>,
    ) -> AdapterResult<String> {
        let deadline = deadline.unwrap_or(DEFAULT_READ_DEADLINE).min(MAX_READ_DEADLINE);
        self.submit(|resp| Request::SendPayload {
            payload: payload.to_string(),
            pre: pre.iter().map(|s| s.to_string()).collect(),
            deadline,
            resp,
        })
    }

    /// Copy of the adapter state as the worker currently knows it
    pub fn state(&self) -> AdapterResult<AdapterState> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(AdapterError::Shutdown);
        }
        let (tx, rx) = mpsc::channel();
        self.queue
            .send(Request::Snapshot { resp: tx })
            .map_err(|_| AdapterError::Shutdown)?;
        rx.recv().map_err(|_| AdapterError::Shutdown)
    }
}

/// Owner of the worker thread (and through it, the transport)
pub struct AdapterController {
    link: AdapterLink,
    detected: Vec<&'static EcuAddress>,
    worker: Option<JoinHandle<()>>,
}

impl AdapterController {
    /// Opens the transport behind `device` and runs the initialization
    /// sequence. On success the adapter is in broadcast mode, filtered on
    /// the first detected ECU, and the returned controller is `Ready`.
    pub fn connect(
        opener: &dyn TransportOpener,
        device: &DeviceRef,
        options: AdapterOptions,
        mut hooks: AdapterHooks,
    ) -> AdapterResult<Self> {
        emit_phase(&mut hooks, Phase::Connecting);
        let transport = opener.open(device)?;
        emit_phase(&mut hooks, Phase::Connected);

        let (queue_tx, queue_rx) = mpsc::channel::<Request>();
        let (init_tx, init_rx) = mpsc::channel::<AdapterResult<Vec<&'static EcuAddress>>>();
        let running = Arc::new(AtomicBool::new(true));
        let running_w = running.clone();

        let worker = std::thread::spawn(move || {
            let mut w = Worker {
                transport,
                state: AdapterState::default(),
                hooks,
                options,
            };
            w.state.phase = Phase::Connected;
            let init_res = w.initialize();
            let ok = init_res.is_ok();
            let _ = init_tx.send(init_res);
            if !ok {
                running_w.store(false, Ordering::Relaxed);
                w.transport.close();
                return;
            }
            w.serve(queue_rx);
            running_w.store(false, Ordering::Relaxed);
            w.set_phase(Phase::Disconnected);
            w.state = AdapterState::default();
            // Transport closes last
            w.transport.close();
        });

        let link = AdapterLink {
            queue: queue_tx,
            running,
        };
        match init_rx.recv() {
            Ok(Ok(detected)) => Ok(Self {
                link,
                detected,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(AdapterError::Shutdown)
            }
        }
    }

    /// Handle for clients that need to talk through the gate
    pub fn link(&self) -> AdapterLink {
        self.link.clone()
    }

    /// ECUs that answered the discovery probe, in reply order
    pub fn detected_ecus(&self) -> &[&'static EcuAddress] {
        &self.detected
    }

    /// See [AdapterLink::exchange]
    pub fn exchange(&self, cmd: &str, deadline: Option<Duration>) -> AdapterResult<String> {
        self.link.exchange(cmd, deadline)
    }

    /// See [AdapterLink::select_ecu]
    pub fn select_ecu(&self, tx: u16, rx: u16) -> AdapterResult<()> {
        self.link.select_ecu(tx, rx)
    }

    /// See [AdapterLink::send_payload]
    pub fn send_payload(
        &self,
        payload: &str,
        pre: &[&str],
        deadline: Option<Duration>,
    ) -> AdapterResult<String> {
        self.link.send_payload(payload, pre, deadline)
    }

    /// See [AdapterLink::state]
    pub fn state(&self) -> AdapterResult<AdapterState> {
        self.link.state()
    }

    /// Waits for any in-flight exchange, resets the adapter state and
    /// closes the channel.
    pub fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            let (tx, rx) = mpsc::channel();
            if self.link.queue.send(Request::Shutdown { resp: tx }).is_ok() {
                let _ = rx.recv();
            }
            let _ = worker.join();
        }
    }
}

impl Drop for AdapterController {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn emit_phase(hooks: &mut AdapterHooks, phase: Phase) {
    if let Some(cb) = hooks.on_state_changed.as_ref() {
        cb(phase);
    }
}

/// The worker: sole owner of the transport, services the queue
struct Worker {
    transport: Box<dyn PromptTransport>,
    state: AdapterState,
    hooks: AdapterHooks,
    options: AdapterOptions,
}

impl Worker {
    fn serve(&mut self, queue: mpsc::Receiver<Request>) {
        while let Ok(req) = queue.recv() {
            match req {
                Request::Exchange {
                    cmd,
                    deadline,
                    resp,
                } => {
                    let _ = resp.send(self.exchange(&cmd, deadline));
                }
                Request::SelectEcu { tx, rx, resp } => {
                    let _ = resp.send(self.select_ecu(tx, rx));
                }
                Request::SendPayload {
                    payload,
                    pre,
                    deadline,
                    resp,
                } => {
                    let _ = resp.send(self.send_payload(&payload, &pre, deadline));
                }
                Request::Snapshot { resp } => {
                    let _ = resp.send(self.state.clone());
                }
                Request::Shutdown { resp } => {
                    let _ = resp.send(());
                    break;
                }
            }
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.state.phase != phase {
            debug!("adapter phase {:?} -> {:?}", self.state.phase, phase);
            self.state.phase = phase;
            emit_phase(&mut self.hooks, phase);
        }
    }

    fn log_line(&self, line: &str) {
        if let Some(cb) = self.hooks.on_log.as_ref() {
            cb(line);
        }
    }

    /// Raw command/reply cycle plus reply cleaning. No interception, no
    /// guard; callers go through [Worker::exchange] for those.
    fn raw_exchange(&mut self, cmd: &str, deadline: Duration) -> AdapterResult<String> {
        self.log_line(&format!(">> {cmd}"));
        if let Err(e) = self.transport.write_line(cmd) {
            self.set_phase(Phase::Errored);
            return Err(e.into());
        }
        let raw = match self.transport.read_until_prompt(deadline) {
            Ok(bytes) => bytes,
            Err(TransportError::ReadTimeout) => {
                // A timeout alone does not poison the connection
                return Err(TransportError::ReadTimeout.into());
            }
            Err(e) => {
                self.set_phase(Phase::Errored);
                return Err(e.into());
            }
        };
        let text = String::from_utf8_lossy(&raw).to_string();
        let cleaned = clean_reply(cmd, &text);
        debug!("adapter {cmd} -> {cleaned:?}");
        self.log_line(&format!("<< {cleaned}"));
        Ok(cleaned)
    }

    /// The public exchange semantics: trim, upper-case, refuse destructive
    /// commands on an active bus, rewrite physical `ATSH`.
    fn exchange(&mut self, cmd: &str, deadline: Duration) -> AdapterResult<String> {
        let cmd = cmd.trim().to_uppercase();
        if self.state.can_bus_active && FORBIDDEN_AFTER_BUS_ACTIVE.contains(&cmd.as_str()) {
            warn!("refusing '{cmd}': bus is active");
            return Err(AdapterError::ForbiddenAfterBusActive(cmd));
        }
        if let Some(suffix) = cmd.strip_prefix("ATSH") {
            if cmd != "ATSH7DF" {
                let tx = u16::from_str_radix(suffix, 16)
                    .map_err(|_| AdapterError::AdapterRejected(cmd.clone()))?;
                let rx = catalog::tx_to_rx(tx);
                debug!("intercepting {cmd}: broadcast + filter {rx:03X}");
                return self.program_filter(tx, rx, deadline);
            }
        }
        self.raw_exchange(&cmd, deadline)
    }

    /// The broadcast rewrite. Emits `ATCRA{rx}`, `ATFCSH{tx}`,
    /// `ATFCSD300000`, `ATFCSM1`, `ATSH7DF` and returns the reply of the
    /// last step. Atomic with respect to other callers because the whole
    /// sequence runs inside one queued request.
    fn program_filter(&mut self, tx: u16, rx: u16, deadline: Duration) -> AdapterResult<String> {
        let steps = [
            format!("ATCRA{rx:03X}"),
            format!("ATFCSH{tx:03X}"),
            "ATFCSD300000".to_string(),
            "ATFCSM1".to_string(),
            "ATSH7DF".to_string(),
        ];
        let mut last = String::new();
        for (i, step) in steps.iter().enumerate() {
            let reply = self.raw_exchange(step, deadline)?;
            if i < 2 && (reply.contains("ERROR") || reply.contains('?')) {
                return Err(AdapterError::AdapterRejected(step.clone()));
            }
            match i {
                0 => self.state.rx_filter = Some(rx),
                1 => self.state.flow_control_header = Some(tx),
                4 => self.state.header_mode = HeaderMode::Broadcast,
                _ => {}
            }
            last = reply;
            if i + 1 < steps.len() {
                std::thread::sleep(self.options.pre_command_delay);
            }
        }
        Ok(last)
    }

    fn select_ecu(&mut self, tx: u16, rx: u16) -> AdapterResult<()> {
        if self.state.rx_filter == Some(rx)
            && self.state.flow_control_header == Some(tx)
            && self.state.header_mode == HeaderMode::Broadcast
        {
            debug!("select {tx:03X}/{rx:03X}: already programmed");
            return Ok(());
        }
        self.program_filter(tx, rx, self.options.read_deadline)
            .map(|_| ())
    }

    fn send_payload(
        &mut self,
        payload: &str,
        pre: &[String],
        deadline: Duration,
    ) -> AdapterResult<String> {
        for cmd in pre {
            self.exchange(cmd, self.options.read_deadline)?;
            std::thread::sleep(self.options.pre_command_delay);
        }
        self.exchange(payload, deadline)
    }

    /// The once-only bring-up: reset, terse line discipline, ISO 15765-4
    /// at 500k, bus probe, ECU discovery, broadcast mode.
    fn initialize(&mut self) -> AdapterResult<Vec<&'static EcuAddress>> {
        self.set_phase(Phase::Initializing);

        let banner = self.raw_exchange("ATZ", MAX_READ_DEADLINE)?;
        std::thread::sleep(self.options.reset_settle);
        match banner.lines().find(|l| l.contains("ELM327")) {
            Some(version) => {
                info!("adapter identified: {version}");
                self.state.version = Some(version.trim().to_string());
            }
            None => warn!("no ELM327 banner in reset reply: {banner:?}"),
        }

        // Terse, header-and-space output. These are never toggled again for
        // the lifetime of the connection.
        for (cmd, apply) in [
            ("ATE0", StateFlag::Echo),
            ("ATL0", StateFlag::Linefeed),
            ("ATH1", StateFlag::HeadersShown),
            ("ATS1", StateFlag::SpacesShown),
            ("ATSP6", StateFlag::None),
            ("ATST64", StateFlag::None),
            ("ATAT1", StateFlag::None),
        ] {
            std::thread::sleep(self.options.init_step_delay);
            self.raw_exchange(cmd, self.options.read_deadline)?;
            match apply {
                StateFlag::Echo => self.state.echo = false,
                StateFlag::Linefeed => self.state.linefeed = false,
                StateFlag::HeadersShown => self.state.headers_shown = true,
                StateFlag::SpacesShown => self.state.spaces_shown = true,
                StateFlag::None => {}
            }
        }

        std::thread::sleep(self.options.init_step_delay);
        let probe = match self.raw_exchange("0100", MAX_READ_DEADLINE) {
            Ok(reply) => reply,
            Err(e) => {
                error!("bus probe failed: {e}");
                self.set_phase(Phase::Errored);
                return Err(AdapterError::BusProbeFailed);
            }
        };
        if ["NO DATA", "UNABLE", "ERROR"]
            .iter()
            .any(|m| probe.contains(m))
        {
            error!("bus probe rejected: {probe:?}");
            self.set_phase(Phase::Errored);
            return Err(AdapterError::BusProbeFailed);
        }

        let detected = discover_ecus(&probe);
        info!(
            "detected ECUs: {:?}",
            detected.iter().map(|e| e.code).collect::<Vec<_>>()
        );

        // Enter broadcast mode filtered on the engine ECU when present,
        // otherwise the first responder.
        let first = detected
            .iter()
            .find(|e| e.code == "ECM")
            .or_else(|| detected.first());
        if let Some(ecu) = first {
            self.program_filter(ecu.tx, ecu.rx, self.options.read_deadline)?;
        } else {
            warn!("probe answered but no catalogued ECU replied");
        }

        self.state.can_bus_active = true;
        self.set_phase(Phase::Ready);
        Ok(detected)
    }
}

enum StateFlag {
    Echo,
    Linefeed,
    HeadersShown,
    SpacesShown,
    None,
}

/// Strips echo, prompts and adapter chatter from a raw reply
fn clean_reply(cmd: &str, raw: &str) -> String {
    raw.split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| *l != cmd)
        .filter(|l| *l != "OK")
        .filter(|l| !l.starts_with("SEARCHING"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Matches the leading 3-nibble CAN id of every probe reply line against
/// the ECU address table, preserving first-seen order
fn discover_ecus(probe: &str) -> Vec<&'static EcuAddress> {
    let mut found: Vec<&'static EcuAddress> = Vec::new();
    for line in probe.lines() {
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        if first.len() != 3 || !first.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        let Ok(rx) = u16::from_str_radix(first, 16) else {
            continue;
        };
        if let Some(ecu) = catalog::ecu_by_rx(rx) {
            if !found.iter().any(|e| e.rx == ecu.rx) {
                found.push(ecu);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::{drain_log, ScriptedTransport};

    struct ScriptedOpener(std::sync::Mutex<Option<ScriptedTransport>>);

    impl TransportOpener for ScriptedOpener {
        fn open(
            &self,
            _device: &DeviceRef,
        ) -> crate::transport::TransportResult<Box<dyn PromptTransport>> {
            Ok(Box::new(self.0.lock().unwrap().take().unwrap()))
        }
    }

    fn fast_options() -> AdapterOptions {
        AdapterOptions {
            reset_settle: Duration::from_millis(1),
            init_step_delay: Duration::from_millis(1),
            pre_command_delay: Duration::from_millis(1),
            read_deadline: Duration::from_millis(100),
        }
    }

    fn base_script() -> ScriptedTransport {
        ScriptedTransport::new()
            .on("ATZ", "ELM327 v1.5")
            .on("0100", "7E8 06 41 00 BE 3F A8 13")
    }

    fn connect(script: ScriptedTransport) -> AdapterResult<AdapterController> {
        let opener = ScriptedOpener(std::sync::Mutex::new(Some(script)));
        AdapterController::connect(
            &opener,
            &DeviceRef::new("mock", "mock"),
            fast_options(),
            AdapterHooks::default(),
        )
    }

    #[test]
    fn initialize_emits_the_documented_sequence() {
        let script = base_script();
        let log = script.sent_log();
        let ctl = connect(script).unwrap();
        let sent = drain_log(&log);
        assert_eq!(
            sent,
            vec![
                "ATZ", "ATE0", "ATL0", "ATH1", "ATS1", "ATSP6", "ATST64", "ATAT1", "0100",
                "ATCRA7E8", "ATFCSH7E0", "ATFCSD300000", "ATFCSM1", "ATSH7DF",
            ]
        );
        let state = ctl.state().unwrap();
        assert_eq!(state.phase, Phase::Ready);
        assert!(state.can_bus_active);
        assert_eq!(state.header_mode, HeaderMode::Broadcast);
        assert_eq!(state.rx_filter, Some(0x7E8));
        assert_eq!(state.flow_control_header, Some(0x7E0));
    }

    #[test]
    fn probe_failure_is_fatal() {
        let script = ScriptedTransport::new()
            .on("ATZ", "ELM327 v1.5")
            .on("0100", "UNABLE TO CONNECT");
        assert!(matches!(connect(script), Err(AdapterError::BusProbeFailed)));
    }

    #[test]
    fn discovery_matches_catalogued_rx_ids() {
        let script = ScriptedTransport::new().on("ATZ", "ELM327 v1.5").on(
            "0100",
            "7E8 06 41 00 BE 3F A8 13\r7E9 06 41 00 88 18 00 01",
        );
        let ctl = connect(script).unwrap();
        let codes: Vec<_> = ctl.detected_ecus().iter().map(|e| e.code).collect();
        assert_eq!(codes, vec!["ECM", "TCM"]);
    }

    #[test]
    fn physical_atsh_is_intercepted() {
        let script = base_script();
        let log = script.sent_log();
        let ctl = connect(script).unwrap();
        drain_log(&log);

        ctl.exchange("ATSH7E0", None).unwrap();
        let sent = drain_log(&log);
        assert_eq!(
            sent,
            vec!["ATCRA7E8", "ATFCSH7E0", "ATFCSD300000", "ATFCSM1", "ATSH7DF"]
        );
        // Invariant: the stream ends on the broadcast header
        assert_eq!(sent.last().unwrap(), "ATSH7DF");
    }

    #[test]
    fn broadcast_atsh_passes_through() {
        let script = base_script();
        let log = script.sent_log();
        let ctl = connect(script).unwrap();
        drain_log(&log);

        ctl.exchange("ATSH7DF", None).unwrap();
        assert_eq!(drain_log(&log), vec!["ATSH7DF"]);
    }

    #[test]
    fn select_bsi_emits_exact_sequence() {
        let script = base_script();
        let log = script.sent_log();
        let ctl = connect(script).unwrap();
        drain_log(&log);

        ctl.select_ecu(0x765, 0x76D).unwrap();
        assert_eq!(
            drain_log(&log),
            vec!["ATCRA76D", "ATFCSH765", "ATFCSD300000", "ATFCSM1", "ATSH7DF"]
        );
        let state = ctl.state().unwrap();
        assert_eq!(state.rx_filter, Some(0x76D));
        assert_eq!(state.flow_control_header, Some(0x765));
        assert_eq!(state.header_mode, HeaderMode::Broadcast);
    }

    #[test]
    fn reselecting_the_programmed_ecu_is_a_no_op() {
        let script = base_script();
        let log = script.sent_log();
        let ctl = connect(script).unwrap();
        drain_log(&log);

        ctl.select_ecu(0x7E0, 0x7E8).unwrap();
        assert!(drain_log(&log).is_empty());
    }

    #[test]
    fn selection_rejection_propagates() {
        let script = base_script().on("ATCRA76D", "ERROR");
        let ctl = connect(script).unwrap();
        assert!(matches!(
            ctl.select_ecu(0x765, 0x76D),
            Err(AdapterError::AdapterRejected(c)) if c == "ATCRA76D"
        ));
    }

    #[test]
    fn destructive_commands_refused_after_bus_active() {
        let script = base_script();
        let log = script.sent_log();
        let ctl = connect(script).unwrap();
        drain_log(&log);

        for cmd in ["ATZ", "ATD", "ATWS", "ATH0", "ATS0"] {
            assert!(matches!(
                ctl.exchange(cmd, None),
                Err(AdapterError::ForbiddenAfterBusActive(_))
            ));
        }
        // Nothing reached the wire
        assert!(drain_log(&log).is_empty());
    }

    #[test]
    fn searching_chatter_is_stripped() {
        let script = base_script().on("22D41F", "SEARCHING...\r7E8 06 62 D4 1F 0B B8");
        let ctl = connect(script).unwrap();
        let reply = ctl.exchange("22D41F", None).unwrap();
        assert_eq!(reply, "7E8 06 62 D4 1F 0B B8");
    }

    #[test]
    fn pre_commands_run_before_payload() {
        let script = base_script();
        let log = script.sent_log();
        let ctl = connect(script).unwrap();
        drain_log(&log);

        ctl.send_payload("22D546", &["ATSH7E0"], None).unwrap();
        let sent = drain_log(&log);
        assert_eq!(
            sent,
            vec![
                "ATCRA7E8", "ATFCSH7E0", "ATFCSD300000", "ATFCSM1", "ATSH7DF", "22D546"
            ]
        );
    }
}
