//! Diagnostic engine: the user-facing orchestration layer
//!
//! Owns the adapter controller and the UDS client, caches the discovered
//! ECU set, keeps the extended session alive and turns catalogued DID and
//! DTC payloads into typed values. This is the surface the presentation
//! layer consumes; everything below it is plumbing.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    adapter::{AdapterController, AdapterError, AdapterHooks, AdapterOptions, Phase},
    catalog::{self, DidDef, EcuAddress},
    dtc::Dtc,
    hardware::{DeviceRef, DeviceScanner, TransportOpener},
    transport::TransportError,
    uds::{UdsClient, UdsSession},
    DiagError, DiagResult,
};

/// Cadence of the TesterPresent heartbeat. The extended session times out
/// around 5 s of silence; 2 s keeps a comfortable margin and must never be
/// stretched past 4 s.
pub const TESTER_PRESENT_INTERVAL: Duration = Duration::from_millis(2000);

/// Consecutive read timeouts tolerated before the engine disconnects
const MAX_TIMEOUT_STRIKES: u32 = 3;

/// Identification placeholder for empty or rejected reads
const NOT_AVAILABLE: &str = "N/A";

/// A decoded DID read
#[derive(Debug, Clone)]
pub struct DidReading {
    pub did: u16,
    pub name: &'static str,
    pub unit: &'static str,
    /// Payload bytes after the echoed identifier
    pub raw: Vec<u8>,
    /// Engineering value from the catalog decoder
    pub scalar: f64,
    /// Display form following the unit's decimal convention
    pub formatted: String,
}

/// An ECU observed during discovery, enriched by identification
#[derive(Debug, Clone)]
pub struct DetectedEcu {
    pub address: &'static EcuAddress,
    pub part_number: Option<String>,
    pub calibration: Option<String>,
    pub hardware_number: Option<String>,
}

/// Identification strings of one ECU; missing reads become `N/A`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuIdentification {
    pub part_number: String,
    pub calibration: String,
    pub hardware_number: String,
}

/// Result of probing one DID group prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupScanResult {
    /// Group prefix, 0xD0..=0xDF
    pub group: u8,
    /// True when the group's presence DID answered
    pub active: bool,
}

/// Snapshot of the engine-side measurement DIDs
#[derive(Debug, Clone, Default)]
pub struct EngineData {
    pub rpm: Option<DidReading>,
    pub coolant_temp: Option<DidReading>,
    pub intake_air_temp: Option<DidReading>,
    pub battery_voltage: Option<DidReading>,
    pub engine_load: Option<DidReading>,
}

/// Snapshot of the particulate-filter DIDs
#[derive(Debug, Clone, Default)]
pub struct DpfData {
    pub soot_loading: Option<DidReading>,
    pub inlet_temp: Option<DidReading>,
    pub outlet_temp: Option<DidReading>,
    pub distance_since_regen: Option<DidReading>,
    pub regen_count: Option<DidReading>,
    pub regen_status: Option<DidReading>,
    /// Catalog text for the status byte
    pub regen_status_text: Option<&'static str>,
}

/// Injected observer sinks for the presentation layer
#[derive(Default, Clone)]
pub struct EngineHooks {
    pub on_state_changed: Option<Arc<dyn Fn(Phase) + Send + Sync>>,
    pub on_log: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl EngineHooks {
    fn report_error(&self, msg: &str) {
        warn!("{msg}");
        if let Some(cb) = self.on_error.as_ref() {
            cb(msg);
        }
    }
}

/// TesterPresent heartbeat task. Ticks through the same adapter gate as
/// normal traffic and therefore simply queues behind it.
struct KeepAlive {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    fn spawn(uds: UdsClient, interval: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_t = running.clone();
        let handle = std::thread::spawn(move || {
            while running_t.load(Ordering::Relaxed) {
                // Sleep in short steps so cancellation is prompt
                let mut slept = Duration::ZERO;
                while slept < interval && running_t.load(Ordering::Relaxed) {
                    let step = Duration::from_millis(50).min(interval - slept);
                    std::thread::sleep(step);
                    slept += step;
                }
                if !running_t.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = uds.tester_present() {
                    debug!("tester present tick failed: {e}");
                }
            }
        });
        Self {
            running,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// The diagnostic engine
pub struct DiagnosticEngine {
    opener: Box<dyn TransportOpener>,
    scanner: Option<Box<dyn DeviceScanner>>,
    options: AdapterOptions,
    hooks: EngineHooks,

    adapter: Option<AdapterController>,
    uds: Option<UdsClient>,
    detected: Vec<DetectedEcu>,
    selected: Option<&'static EcuAddress>,
    session: UdsSession,
    keep_alive: Option<KeepAlive>,
    timeout_strikes: u32,
}

impl DiagnosticEngine {
    pub fn new(opener: Box<dyn TransportOpener>) -> Self {
        Self {
            opener,
            scanner: None,
            options: AdapterOptions::default(),
            hooks: EngineHooks::default(),
            adapter: None,
            uds: None,
            detected: Vec::new(),
            selected: None,
            session: UdsSession::Default,
            keep_alive: None,
            timeout_strikes: 0,
        }
    }

    /// Registers the platform's paired-device enumerator
    pub fn with_scanner(mut self, scanner: Box<dyn DeviceScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_options(mut self, options: AdapterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_hooks(mut self, hooks: EngineHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Devices the platform layer knows about
    pub fn list_paired_devices(&self) -> Vec<DeviceRef> {
        self.scanner
            .as_ref()
            .map(|s| s.list_devices())
            .unwrap_or_default()
    }

    /// Opens the adapter and brings the bus up. Discovery happens as part
    /// of initialization; the detected set is cached here.
    pub fn connect(&mut self, device: &DeviceRef) -> DiagResult<()> {
        if self.adapter.is_some() {
            return Ok(());
        }
        info!("connecting to {}", device.name);
        let adapter_hooks = AdapterHooks {
            on_state_changed: self.hooks.on_state_changed.clone().map(|cb| {
                Box::new(move |p: Phase| cb(p)) as Box<dyn Fn(Phase) + Send>
            }),
            on_log: self.hooks.on_log.clone().map(|cb| {
                Box::new(move |l: &str| cb(l)) as Box<dyn Fn(&str) + Send>
            }),
        };
        let adapter =
            match AdapterController::connect(self.opener.as_ref(), device, self.options, adapter_hooks)
            {
                Ok(a) => a,
                Err(e) => {
                    self.hooks.report_error(&format!("connection failed: {e}"));
                    return Err(e.into());
                }
            };
        self.detected = adapter
            .detected_ecus()
            .iter()
            .map(|address| DetectedEcu {
                address,
                part_number: None,
                calibration: None,
                hardware_number: None,
            })
            .collect();
        // Initialization programmed the filter for the engine ECU when it
        // answered, otherwise the first responder
        self.selected = adapter
            .detected_ecus()
            .iter()
            .find(|e| e.code == "ECM")
            .or_else(|| adapter.detected_ecus().first())
            .copied();
        self.uds = Some(UdsClient::new(adapter.link()));
        self.adapter = Some(adapter);
        self.session = UdsSession::Default;
        self.timeout_strikes = 0;
        Ok(())
    }

    /// Cancels the keep-alive, waits out any in-flight exchange and closes
    /// the channel
    pub fn disconnect(&mut self) {
        if let Some(ka) = self.keep_alive.take() {
            ka.stop();
        }
        if let Some(mut adapter) = self.adapter.take() {
            adapter.disconnect();
        }
        self.uds = None;
        self.detected.clear();
        self.selected = None;
        self.session = UdsSession::Default;
        self.timeout_strikes = 0;
        info!("disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.adapter.is_some()
    }

    /// ECUs that answered the discovery probe
    pub fn detected_ecus(&self) -> &[DetectedEcu] {
        &self.detected
    }

    /// Currently selected ECU, when connected
    pub fn selected_ecu(&self) -> Option<&'static EcuAddress> {
        self.selected
    }

    /// Points the adapter's filter at the ECU with the given catalog code.
    /// Idempotent: reselecting the current ECU does nothing.
    pub fn select_ecu(&mut self, code: &str) -> DiagResult<()> {
        let ecu = catalog::ecu_by_code(code).ok_or(DiagError::UnknownEcu)?;
        if self.selected.map(|e| e.code) == Some(ecu.code) {
            return Ok(());
        }
        let res = {
            let adapter = self.adapter.as_ref().ok_or(AdapterError::NotConnected)?;
            adapter.select_ecu(ecu.tx, ecu.rx).map_err(DiagError::from)
        };
        self.guard(res)?;
        self.selected = Some(ecu);
        debug!("selected {} ({}/{})", ecu.code, ecu.tx_hex(), ecu.rx_hex());
        Ok(())
    }

    /// Reads one catalogued DID from the selected ECU
    pub fn read_did(&mut self, did: u16) -> DiagResult<DidReading> {
        let def = catalog::did_by_id(did).ok_or(DiagError::UnknownDid(did))?;
        self.ensure_extended()?;
        let uds = self.uds.as_ref().ok_or(AdapterError::NotConnected)?.clone();
        let raw = self.guard(uds.read_data_by_identifier(did))?;
        if raw.len() < def.expected_len {
            debug!(
                "did {did:04X}: expected {} payload bytes, got {}",
                def.expected_len,
                raw.len()
            );
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(decode_reading(def, raw))
    }

    /// Engine-side measurement snapshot. Individual DIDs the ECU does not
    /// answer are left empty; hard failures propagate.
    pub fn read_engine_snapshot(&mut self) -> DiagResult<EngineData> {
        self.select_ecu("ECM")?;
        Ok(EngineData {
            rpm: self.try_read(0xD41F)?,
            coolant_temp: self.try_read(0xD405)?,
            intake_air_temp: self.try_read(0xD408)?,
            battery_voltage: self.try_read(0xD410)?,
            engine_load: self.try_read(0xD42C)?,
        })
    }

    /// Particulate-filter snapshot from the engine ECU
    pub fn read_dpf_snapshot(&mut self) -> DiagResult<DpfData> {
        self.select_ecu("ECM")?;
        let regen_status = self.try_read(0xD545)?;
        let regen_status_text = regen_status
            .as_ref()
            .map(|r| catalog::dpf_regen_status(r.scalar as u8));
        Ok(DpfData {
            soot_loading: self.try_read(0xD546)?,
            inlet_temp: self.try_read(0xD541)?,
            outlet_temp: self.try_read(0xD542)?,
            distance_since_regen: self.try_read(0xD543)?,
            regen_count: self.try_read(0xD544)?,
            regen_status,
            regen_status_text,
        })
    }

    /// Injector flow corrections: four signed 16-bit centivalues in mm³
    pub fn read_injector_corrections(&mut self) -> DiagResult<[f64; 4]> {
        self.select_ecu("ECM")?;
        self.ensure_extended()?;
        let uds = self.uds.as_ref().ok_or(AdapterError::NotConnected)?.clone();
        let raw = self.guard(uds.read_data_by_identifier(catalog::DID_INJECTOR_CORRECTIONS))?;
        if raw.len() < 8 {
            return Err(DiagError::InvalidResponseLength);
        }
        let mut out = [0.0f64; 4];
        for (i, pair) in raw[..8].chunks_exact(2).enumerate() {
            let v = i16::from_be_bytes([pair[0], pair[1]]);
            out[i] = v as f64 * 0.01;
        }
        Ok(out)
    }

    /// Reads and decodes all stored DTCs of the given ECU, preserving
    /// on-wire order
    pub fn read_dtcs(&mut self, code: &str) -> DiagResult<Vec<Dtc>> {
        self.select_ecu(code)?;
        self.ensure_extended()?;
        let uds = self.uds.as_ref().ok_or(AdapterError::NotConnected)?.clone();
        let (mask, records) = self.guard(uds.read_dtc_information())?;
        debug!("dtc availability mask {mask:02X}, {} records", records.len());
        Ok(records
            .into_iter()
            .map(|(hi, lo, status)| Dtc::from_wire(hi, lo, status))
            .collect())
    }

    /// Clears all diagnostic information on the given ECU. `Ok(true)` iff
    /// the ECU acknowledged; a negative response propagates as
    /// [DiagError::NegativeResponse].
    pub fn clear_dtcs(&mut self, code: &str) -> DiagResult<bool> {
        self.select_ecu(code)?;
        self.ensure_extended()?;
        let uds = self.uds.as_ref().ok_or(AdapterError::NotConnected)?.clone();
        match self.guard(uds.clear_diagnostic_information()) {
            Ok(()) => Ok(true),
            Err(e @ DiagError::NegativeResponse { .. }) => {
                self.hooks.report_error(&format!("clear rejected: {e}"));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Reads the identification DIDs of the given ECU. Unreadable fields
    /// come back as `N/A`; the detected-ECU cache is updated alongside.
    pub fn identify_ecu(&mut self, code: &str) -> DiagResult<EcuIdentification> {
        self.select_ecu(code)?;
        self.ensure_extended()?;
        let part_number = self.read_ident_string(catalog::DID_PART_NUMBER)?;
        let calibration = self.read_ident_string(catalog::DID_CALIBRATION)?;
        let hardware_number = self.read_ident_string(catalog::DID_HARDWARE_NUMBER)?;
        let ident = EcuIdentification {
            part_number,
            calibration,
            hardware_number,
        };
        if let Some(entry) = self
            .detected
            .iter_mut()
            .find(|d| d.address.code.eq_ignore_ascii_case(code))
        {
            entry.part_number = Some(ident.part_number.clone());
            entry.calibration = Some(ident.calibration.clone());
            entry.hardware_number = Some(ident.hardware_number.clone());
        }
        Ok(ident)
    }

    /// Probes every 0xDx group prefix with its presence DID, in order
    pub fn scan_did_groups(&mut self, code: &str) -> DiagResult<Vec<GroupScanResult>> {
        self.select_ecu(code)?;
        self.ensure_extended()?;
        let uds = self.uds.as_ref().ok_or(AdapterError::NotConnected)?.clone();
        let mut results = Vec::with_capacity(16);
        for group in 0xD0u8..=0xDF {
            let did = (group as u16) << 8;
            let active = match self.guard(uds.read_data_by_identifier(did)) {
                Ok(_) => true,
                Err(
                    DiagError::NoData
                    | DiagError::NegativeResponse { .. }
                    | DiagError::ProtocolMismatch,
                ) => false,
                Err(e) => return Err(e),
            };
            results.push(GroupScanResult { group, active });
        }
        Ok(results)
    }

    /// Reads a DID, mapping "ECU did not answer" outcomes to `None`
    fn try_read(&mut self, did: u16) -> DiagResult<Option<DidReading>> {
        match self.read_did(did) {
            Ok(r) => Ok(Some(r)),
            Err(
                DiagError::NoData
                | DiagError::NegativeResponse { .. }
                | DiagError::ProtocolMismatch
                | DiagError::InvalidResponseLength,
            ) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_ident_string(&mut self, did: u16) -> DiagResult<String> {
        let uds = self.uds.as_ref().ok_or(AdapterError::NotConnected)?.clone();
        match self.guard(uds.read_data_by_identifier(did)) {
            Ok(raw) => {
                let text: String = raw
                    .iter()
                    .copied()
                    .filter(|b| (0x20..=0x7E).contains(b))
                    .map(char::from)
                    .collect();
                let text = text.trim().to_string();
                Ok(if text.is_empty() {
                    NOT_AVAILABLE.to_string()
                } else {
                    text
                })
            }
            Err(
                DiagError::NoData
                | DiagError::NegativeResponse { .. }
                | DiagError::ProtocolMismatch,
            ) => Ok(NOT_AVAILABLE.to_string()),
            Err(e) => Err(e),
        }
    }

    /// Opens the extended session once and starts the heartbeat. Sparse
    /// clones answer `1003` with nothing at all; fall through and let the
    /// next request fail cleanly if the session did not open.
    fn ensure_extended(&mut self) -> DiagResult<()> {
        if self.session == UdsSession::Extended {
            return Ok(());
        }
        let uds = self.uds.as_ref().ok_or(AdapterError::NotConnected)?.clone();
        match self.guard(uds.session_control(UdsSession::Extended)) {
            Ok(()) => {}
            Err(DiagError::NoData) => {
                debug!("extended session request got no reply, continuing anyway");
            }
            Err(e) => return Err(e),
        }
        self.session = UdsSession::Extended;
        if self.keep_alive.is_none() {
            self.keep_alive = Some(KeepAlive::spawn(uds, TESTER_PRESENT_INTERVAL));
        }
        Ok(())
    }

    /// Tracks consecutive read timeouts; too many in a row and the
    /// connection is torn down.
    fn guard<T>(&mut self, res: DiagResult<T>) -> DiagResult<T> {
        match &res {
            Err(DiagError::Adapter(AdapterError::Transport(TransportError::ReadTimeout))) => {
                self.timeout_strikes += 1;
                if self.timeout_strikes >= MAX_TIMEOUT_STRIKES {
                    self.hooks
                        .report_error("adapter stopped answering, disconnecting");
                    self.disconnect();
                }
            }
            Err(_) => {}
            Ok(_) => self.timeout_strikes = 0,
        }
        res
    }
}

impl Drop for DiagnosticEngine {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Caller guarantees `raw` is at least `expected_len` long
fn decode_reading(def: &'static DidDef, raw: Vec<u8>) -> DidReading {
    let scalar = (def.decode)(&raw[..def.expected_len]);
    DidReading {
        did: def.id,
        name: def.name,
        unit: def.unit,
        formatted: format_reading(def.unit, scalar),
        scalar,
        raw,
    }
}

/// Decimal conventions: integers for rpm/km/counters, two places for
/// voltages and injector volumes, one place for everything else.
pub fn format_reading(unit: &str, value: f64) -> String {
    let number = match unit {
        "rpm" | "km" | "" => format!("{value:.0}"),
        "V" | "mm³" => format!("{value:.2}"),
        _ => format!("{value:.1}"),
    };
    if unit.is_empty() {
        number
    } else {
        format!("{number} {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_follows_unit_conventions() {
        assert_eq!(format_reading("rpm", 750.0), "750 rpm");
        assert_eq!(format_reading("km", 482.0), "482 km");
        assert_eq!(format_reading("", 12.0), "12");
        assert_eq!(format_reading("V", 12.34), "12.34 V");
        assert_eq!(format_reading("mm³", -1.0), "-1.00 mm³");
        assert_eq!(format_reading("°C", 89.94), "89.9 °C");
        assert_eq!(format_reading("%", 41.2), "41.2 %");
        assert_eq!(format_reading("g/l", 46.6), "46.6 g/l");
    }

    #[test]
    fn reading_decodes_through_the_catalog() {
        let def = catalog::did_by_id(0xD41F).unwrap();
        let r = decode_reading(def, vec![0x0B, 0xB8]);
        assert_eq!(r.scalar, 750.0);
        assert_eq!(r.formatted, "750 rpm");
        assert_eq!(r.raw, vec![0x0B, 0xB8]);
    }
}
