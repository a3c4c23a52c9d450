//! Connects to an ELM327 on a serial port, reads the engine and DPF
//! snapshots and lists stored trouble codes.
//!
//! Usage: cargo run --example read_snapshot -- /dev/rfcomm0

use elm_diagnostics::{
    engine::{DiagnosticEngine, EngineHooks},
    hardware::{DeviceRef, SerialPortOpener},
};

fn print_reading(label: &str, r: &Option<elm_diagnostics::engine::DidReading>) {
    match r {
        Some(r) => println!("  {label}: {}", r.formatted),
        None => println!("  {label}: -"),
    }
}

fn main() {
    env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/rfcomm0".into());
    let device = DeviceRef::new("ELM327", path);

    let hooks = EngineHooks {
        on_state_changed: Some(std::sync::Arc::new(|phase| {
            println!("== adapter phase: {phase:?}");
        })),
        ..Default::default()
    };

    let mut engine = DiagnosticEngine::new(Box::new(SerialPortOpener::new())).with_hooks(hooks);

    if let Err(e) = engine.connect(&device) {
        eprintln!("connection failed: {e}");
        std::process::exit(1);
    }

    println!("Detected ECUs:");
    for ecu in engine.detected_ecus() {
        println!(
            "  {} - {} ({}/{})",
            ecu.address.code,
            ecu.address.name,
            ecu.address.tx_hex(),
            ecu.address.rx_hex()
        );
    }

    match engine.read_engine_snapshot() {
        Ok(snap) => {
            println!("Engine:");
            print_reading("speed", &snap.rpm);
            print_reading("coolant", &snap.coolant_temp);
            print_reading("battery", &snap.battery_voltage);
            print_reading("load", &snap.engine_load);
        }
        Err(e) => eprintln!("engine snapshot failed: {e}"),
    }

    match engine.read_dpf_snapshot() {
        Ok(snap) => {
            println!("Particulate filter:");
            print_reading("soot", &snap.soot_loading);
            print_reading("inlet", &snap.inlet_temp);
            print_reading("outlet", &snap.outlet_temp);
            if let Some(status) = snap.regen_status_text {
                println!("  regeneration: {status}");
            }
        }
        Err(e) => eprintln!("dpf snapshot failed: {e}"),
    }

    match engine.read_dtcs("ECM") {
        Ok(dtcs) if dtcs.is_empty() => println!("No stored trouble codes"),
        Ok(dtcs) => {
            println!("Stored trouble codes:");
            for dtc in dtcs {
                println!("  {dtc}");
            }
        }
        Err(e) => eprintln!("DTC read failed: {e}"),
    }

    engine.disconnect();
}
