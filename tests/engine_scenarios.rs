//! End-to-end scenarios against a scripted ELM327

use std::sync::Mutex;
use std::time::Duration;

use elm_diagnostics::{
    adapter::AdapterOptions,
    engine::DiagnosticEngine,
    hardware::{
        simulation::{drain_log, ScriptedTransport, SentLog},
        DeviceRef, TransportOpener,
    },
    transport::{PromptTransport, TransportResult},
    DiagError,
};

struct ScriptedOpener(Mutex<Option<ScriptedTransport>>);

impl TransportOpener for ScriptedOpener {
    fn open(&self, _device: &DeviceRef) -> TransportResult<Box<dyn PromptTransport>> {
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

/// Script with a healthy two-ECU bus and the common session replies
fn base_script() -> ScriptedTransport {
    ScriptedTransport::new()
        .on("ATZ", "ELM327 v1.5")
        .on("0100", "7E8 06 41 00 BE 3F A8 13\r7E9 06 41 00 88 18 00 01")
        .on("1003", "7E8 06 50 03 00 32 01 F4")
        .on("3E00", "7E8 02 7E 00")
}

fn engine_for(script: ScriptedTransport) -> (DiagnosticEngine, SentLog) {
    let _ = env_logger::builder().is_test(true).try_init();
    let log = script.sent_log();
    let opener = ScriptedOpener(Mutex::new(Some(script)));
    let mut engine = DiagnosticEngine::new(Box::new(opener)).with_options(fast_options());
    engine
        .connect(&DeviceRef::new("mock", "mock"))
        .expect("connect");
    (engine, log)
}

/// The keep-alive may tick in the background; drop its lines before
/// asserting on command order
fn commands_without_heartbeat(log: &SentLog) -> Vec<String> {
    drain_log(log).into_iter().filter(|c| c != "3E00").collect()
}

#[test]
fn probe_and_discover_finds_ecm_and_tcm() {
    let (engine, _log) = engine_for(base_script());
    let codes: Vec<_> = engine
        .detected_ecus()
        .iter()
        .map(|d| d.address.code)
        .collect();
    assert_eq!(codes, vec!["ECM", "TCM"]);
    assert_eq!(engine.selected_ecu().unwrap().code, "ECM");
}

#[test]
fn select_bsi_emits_the_exact_filter_sequence() {
    let (mut engine, log) = engine_for(base_script());
    drain_log(&log);

    engine.select_ecu("BSI").unwrap();
    assert_eq!(
        commands_without_heartbeat(&log),
        vec!["ATCRA76D", "ATFCSH765", "ATFCSD300000", "ATFCSM1", "ATSH7DF"]
    );

    // Idempotent: selecting it again touches nothing
    engine.select_ecu("BSI").unwrap();
    assert!(commands_without_heartbeat(&log).is_empty());
}

#[test]
fn unknown_ecu_code_is_refused() {
    let (mut engine, _log) = engine_for(base_script());
    assert!(matches!(
        engine.select_ecu("ABS"),
        Err(DiagError::UnknownEcu)
    ));
}

#[test]
fn read_rpm_round_trip() {
    let script = base_script().on("22D41F", "7E8 06 62 D4 1F 0B B8");
    let (mut engine, _log) = engine_for(script);

    let reading = engine.read_did(0xD41F).unwrap();
    assert_eq!(reading.scalar, 750.0);
    assert_eq!(reading.unit, "rpm");
    assert_eq!(reading.formatted, "750 rpm");
    assert_eq!(reading.raw, vec![0x0B, 0xB8]);
}

#[test]
fn read_soot_loading() {
    let script = base_script().on("22D546", "7E8 04 62 D5 46 12 34");
    let (mut engine, _log) = engine_for(script);

    let reading = engine.read_did(0xD546).unwrap();
    assert!((reading.scalar - 46.60).abs() < 1e-9);
    assert_eq!(reading.formatted, "46.6 g/l");
}

#[test]
fn extended_session_is_opened_once_before_measurement_reads() {
    let script = base_script().on("22D41F", "7E8 06 62 D4 1F 0B B8");
    let (mut engine, log) = engine_for(script);
    drain_log(&log);

    engine.read_did(0xD41F).unwrap();
    engine.read_did(0xD41F).unwrap();
    let sent = commands_without_heartbeat(&log);
    assert_eq!(sent, vec!["1003", "22D41F", "22D41F"]);
}

#[test]
fn sparse_clone_session_reply_falls_through() {
    // No 1003 script entry: the request answers NO DATA, reads proceed
    let script = ScriptedTransport::new()
        .on("ATZ", "ELM327 v1.5")
        .on("0100", "7E8 06 41 00 BE 3F A8 13")
        .on("3E00", "7E8 02 7E 00")
        .on("22D41F", "7E8 06 62 D4 1F 0B B8");
    let (mut engine, _log) = engine_for(script);

    let reading = engine.read_did(0xD41F).unwrap();
    assert_eq!(reading.scalar, 750.0);
}

#[test]
fn read_dtcs_decodes_the_multi_frame_reply_in_order() {
    let script = base_script().on("1902FF", "7E8 10 09 59 02 FF 04 20 09\r7E8 21 01 34 08");
    let (mut engine, _log) = engine_for(script);

    let dtcs = engine.read_dtcs("ECM").unwrap();
    assert_eq!(dtcs.len(), 2);

    assert_eq!(dtcs[0].code, "P0420");
    assert_eq!(dtcs[0].status, 0x09);
    assert!(dtcs[0].confirmed());
    assert!(dtcs[0].test_failed());
    assert!(!dtcs[0].pending());
    assert_eq!(
        dtcs[0].description,
        "Catalyst system efficiency below threshold (bank 1)"
    );

    assert_eq!(dtcs[1].code, "P0134");
    assert_eq!(dtcs[1].status, 0x08);
    assert!(dtcs[1].confirmed());
    assert!(!dtcs[1].test_failed());
}

#[test]
fn clear_dtcs_positive_and_negative() {
    let script = base_script().on("14FFFFFF", "7E8 01 54");
    let (mut engine, _log) = engine_for(script);
    assert_eq!(engine.clear_dtcs("ECM").unwrap(), true);

    let script = base_script().on("14FFFFFF", "7E8 03 7F 14 22");
    let (mut engine, _log) = engine_for(script);
    let res = engine.clear_dtcs("ECM");
    match &res {
        Err(DiagError::NegativeResponse { service, nrc }) => {
            assert_eq!(*service, 0x14);
            assert_eq!(*nrc, 0x22);
        }
        other => panic!("expected negative response, got {other:?}"),
    }
    assert!(!res.unwrap_or(false));
}

#[test]
fn injector_corrections_split_into_four_signed_values() {
    let script = base_script().on(
        "22D482",
        "7E8 10 0B 62 D4 82 FF 9C 00\r7E8 21 64 FE 0C 01 F4",
    );
    let (mut engine, _log) = engine_for(script);

    let corr = engine.read_injector_corrections().unwrap();
    assert_eq!(corr, [-1.00, 1.00, -5.00, 5.00]);
}

#[test]
fn identification_filters_ascii_and_defaults_missing_fields() {
    let script = base_script()
        .on("22F080", "7E8 10 0D 62 F0 80 39 36 36\r7E8 21 36 32 32 31 35 38 30")
        .on("22F091", "7E8 07 62 F0 91 48 57 30 31");
    let (mut engine, _log) = engine_for(script);

    let ident = engine.identify_ecu("ECM").unwrap();
    assert_eq!(ident.part_number, "9666221580");
    assert_eq!(ident.hardware_number, "HW01");
    // 22F0FE was not scripted and answered NO DATA
    assert_eq!(ident.calibration, "N/A");

    // The detected-ECU cache learned the identification
    let ecm = engine
        .detected_ecus()
        .iter()
        .find(|d| d.address.code == "ECM")
        .unwrap();
    assert_eq!(ecm.part_number.as_deref(), Some("9666221580"));
}

#[test]
fn group_scan_preserves_order_and_marks_responders() {
    let script = base_script()
        .on("22D400", "7E8 04 62 D4 00 01")
        .on("22D500", "7E8 04 62 D5 00 01");
    let (mut engine, _log) = engine_for(script);

    let results = engine.scan_did_groups("ECM").unwrap();
    assert_eq!(results.len(), 16);
    let groups: Vec<u8> = results.iter().map(|r| r.group).collect();
    assert_eq!(groups, (0xD0..=0xDF).collect::<Vec<u8>>());
    for r in &results {
        let expect = r.group == 0xD4 || r.group == 0xD5;
        assert_eq!(r.active, expect, "group {:02X}", r.group);
    }
}

#[test]
fn engine_snapshot_reads_what_the_ecu_offers() {
    let script = base_script()
        .on("22D41F", "7E8 06 62 D4 1F 0B B8")
        .on("22D405", "7E8 04 62 D4 05 5A")
        .on("22D410", "7E8 05 62 D4 10 04 D2");
    let (mut engine, _log) = engine_for(script);

    let snap = engine.read_engine_snapshot().unwrap();
    assert_eq!(snap.rpm.as_ref().unwrap().scalar, 750.0);
    assert_eq!(snap.coolant_temp.as_ref().unwrap().scalar, 50.0);
    assert_eq!(snap.battery_voltage.as_ref().unwrap().formatted, "12.34 V");
    // Unanswered DIDs stay empty instead of failing the snapshot
    assert!(snap.intake_air_temp.is_none());
    assert!(snap.engine_load.is_none());
}

#[test]
fn dpf_snapshot_resolves_the_regeneration_status_text() {
    let script = base_script()
        .on("22D546", "7E8 04 62 D5 46 12 34")
        .on("22D545", "7E8 04 62 D5 45 02");
    let (mut engine, _log) = engine_for(script);

    let snap = engine.read_dpf_snapshot().unwrap();
    assert!((snap.soot_loading.as_ref().unwrap().scalar - 46.6).abs() < 1e-9);
    assert_eq!(snap.regen_status_text, Some("In progress"));
    assert!(snap.inlet_temp.is_none());
}

#[test]
fn bus_probe_failure_surfaces_and_nothing_connects() {
    let _ = env_logger::builder().is_test(true).try_init();
    let script = ScriptedTransport::new()
        .on("ATZ", "ELM327 v1.5")
        .on("0100", "UNABLE TO CONNECT");
    let opener = ScriptedOpener(Mutex::new(Some(script)));
    let mut engine = DiagnosticEngine::new(Box::new(opener)).with_options(fast_options());
    assert!(engine.connect(&DeviceRef::new("mock", "mock")).is_err());
    assert!(!engine.is_connected());
    assert!(engine.detected_ecus().is_empty());
}
