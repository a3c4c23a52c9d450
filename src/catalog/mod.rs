//! Static catalogs: ECU address map, DID definitions, DTC descriptions and
//! the DPF regeneration status table
//!
//! Every table here is a program-wide constant. Nothing mutates them after
//! startup and no lookup allocates.

/// CAN broadcast id used for every request on this adapter family
pub const OBD_BROADCAST_ID: u16 = 0x7DF;

/// Addressing pair of a diagnosable control unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcuAddress {
    /// Short tag, e.g. `ECM`
    pub code: &'static str,
    /// Human readable name
    pub name: &'static str,
    /// 11-bit request id the ECU listens on
    pub tx: u16,
    /// 11-bit response id the ECU answers from
    pub rx: u16,
}

impl EcuAddress {
    /// Request id as the 3-nibble uppercase hex the adapter expects
    pub fn tx_hex(&self) -> String {
        format!("{:03X}", self.tx)
    }

    /// Response id as 3-nibble uppercase hex
    pub fn rx_hex(&self) -> String {
        format!("{:03X}", self.rx)
    }
}

/// The control units this tester knows how to address.
///
/// The 0x7Ex range follows the ISO 15765-4 convention (`rx = tx + 8`); the
/// body computer pair 0x765/0x76D is manufacturer specific and tabled
/// explicitly.
pub const ECU_ADDRESSES: &[EcuAddress] = &[
    EcuAddress {
        code: "ECM",
        name: "Engine control module",
        tx: 0x7E0,
        rx: 0x7E8,
    },
    EcuAddress {
        code: "TCM",
        name: "Transmission control module",
        tx: 0x7E1,
        rx: 0x7E9,
    },
    EcuAddress {
        code: "BSI",
        name: "Built-in systems interface",
        tx: 0x765,
        rx: 0x76D,
    },
];

/// Looks an ECU up by its short tag
pub fn ecu_by_code(code: &str) -> Option<&'static EcuAddress> {
    ECU_ADDRESSES.iter().find(|e| e.code.eq_ignore_ascii_case(code))
}

/// Looks an ECU up by the response id it answers from
pub fn ecu_by_rx(rx: u16) -> Option<&'static EcuAddress> {
    ECU_ADDRESSES.iter().find(|e| e.rx == rx)
}

/// Looks an ECU up by the request id it listens on
pub fn ecu_by_tx(tx: u16) -> Option<&'static EcuAddress> {
    ECU_ADDRESSES.iter().find(|e| e.tx == tx)
}

/// Maps a request id to the response id the ECU will answer from.
///
/// Tabled pairs win; anything else falls back to the ISO 15765-4
/// convention of `tx + 8`, wrapped to 11 bits.
pub fn tx_to_rx(tx: u16) -> u16 {
    match ecu_by_tx(tx) {
        Some(e) => e.rx,
        None => (tx + 8) & 0xFFF,
    }
}

/// A datum readable through service 0x22
#[derive(Clone, Copy)]
pub struct DidDef {
    /// 16-bit data identifier
    pub id: u16,
    /// What the datum is
    pub name: &'static str,
    /// Display unit; empty for unitless counters
    pub unit: &'static str,
    /// Group prefix (high byte of the id)
    pub group: u8,
    /// Payload length the ECU is expected to return
    pub expected_len: usize,
    /// Raw payload to engineering value
    pub decode: fn(&[u8]) -> f64,
}

impl std::fmt::Debug for DidDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DidDef")
            .field("id", &format_args!("0x{:04X}", self.id))
            .field("name", &self.name)
            .field("unit", &self.unit)
            .finish()
    }
}

fn be_u16(data: &[u8]) -> u16 {
    ((data[0] as u16) << 8) | data[1] as u16
}

fn decode_quarter_rpm(data: &[u8]) -> f64 {
    be_u16(data) as f64 / 4.0
}

fn decode_temp_offset40(data: &[u8]) -> f64 {
    data[0] as f64 - 40.0
}

fn decode_temp16_offset40(data: &[u8]) -> f64 {
    be_u16(data) as f64 - 40.0
}

fn decode_centi(data: &[u8]) -> f64 {
    be_u16(data) as f64 * 0.01
}

fn decode_percent255(data: &[u8]) -> f64 {
    data[0] as f64 * 100.0 / 255.0
}

fn decode_u16(data: &[u8]) -> f64 {
    be_u16(data) as f64
}

fn decode_u8(data: &[u8]) -> f64 {
    data[0] as f64
}

/// DID used by [crate::engine::DiagnosticEngine::read_injector_corrections]
pub const DID_INJECTOR_CORRECTIONS: u16 = 0xD482;

/// Identification DIDs, printable-ASCII payloads
pub const DID_PART_NUMBER: u16 = 0xF080;
pub const DID_CALIBRATION: u16 = 0xF0FE;
pub const DID_HARDWARE_NUMBER: u16 = 0xF091;

/// The measurement catalog.
///
/// Groups: 0xD4 engine, 0xD5 particulate filter. Identification (0xF0xx)
/// payloads are text and handled by the engine directly.
pub const DID_CATALOG: &[DidDef] = &[
    DidDef {
        id: 0xD41F,
        name: "Engine speed",
        unit: "rpm",
        group: 0xD4,
        expected_len: 2,
        decode: decode_quarter_rpm,
    },
    DidDef {
        id: 0xD405,
        name: "Coolant temperature",
        unit: "°C",
        group: 0xD4,
        expected_len: 1,
        decode: decode_temp_offset40,
    },
    DidDef {
        id: 0xD408,
        name: "Intake air temperature",
        unit: "°C",
        group: 0xD4,
        expected_len: 1,
        decode: decode_temp_offset40,
    },
    DidDef {
        id: 0xD410,
        name: "Battery voltage",
        unit: "V",
        group: 0xD4,
        expected_len: 2,
        decode: decode_centi,
    },
    DidDef {
        id: 0xD42C,
        name: "Engine load",
        unit: "%",
        group: 0xD4,
        expected_len: 1,
        decode: decode_percent255,
    },
    DidDef {
        id: 0xD482,
        name: "Injector flow corrections",
        unit: "mm³",
        group: 0xD4,
        expected_len: 8,
        // Scalar view is the first corrector; the engine exposes all four
        decode: |d| (be_u16(d) as i16) as f64 * 0.01,
    },
    DidDef {
        id: 0xD546,
        name: "Soot loading",
        unit: "g/l",
        group: 0xD5,
        expected_len: 2,
        decode: decode_centi,
    },
    DidDef {
        id: 0xD541,
        name: "Filter inlet temperature",
        unit: "°C",
        group: 0xD5,
        expected_len: 2,
        decode: decode_temp16_offset40,
    },
    DidDef {
        id: 0xD542,
        name: "Filter outlet temperature",
        unit: "°C",
        group: 0xD5,
        expected_len: 2,
        decode: decode_temp16_offset40,
    },
    DidDef {
        id: 0xD543,
        name: "Distance since last regeneration",
        unit: "km",
        group: 0xD5,
        expected_len: 2,
        decode: decode_u16,
    },
    DidDef {
        id: 0xD544,
        name: "Regeneration count",
        unit: "",
        group: 0xD5,
        expected_len: 2,
        decode: decode_u16,
    },
    DidDef {
        id: 0xD545,
        name: "Regeneration status",
        unit: "",
        group: 0xD5,
        expected_len: 1,
        decode: decode_u8,
    },
];

/// Looks a DID definition up by id
pub fn did_by_id(id: u16) -> Option<&'static DidDef> {
    DID_CATALOG.iter().find(|d| d.id == id)
}

/// Human text for a DPF regeneration status byte (DID 0xD545)
pub fn dpf_regen_status(status: u8) -> &'static str {
    match status {
        0x00 => "Inactive",
        0x01 => "Requested",
        0x02 => "In progress",
        0x03 => "Completed",
        0x04 => "Inhibited (conditions not met)",
        0x05 => "Failed",
        _ => "Unknown",
    }
}

/// Descriptions for the trouble codes this tester most often meets.
/// Codes absent here surface as "Unknown DTC".
const DTC_DESCRIPTIONS: &[(&str, &str)] = &[
    ("P0087", "Fuel rail pressure too low"),
    ("P0088", "Fuel rail pressure too high"),
    ("P0101", "Mass air flow sensor range/performance"),
    ("P0134", "O2 sensor circuit no activity detected (bank 1, sensor 1)"),
    ("P0201", "Injector circuit malfunction, cylinder 1"),
    ("P0202", "Injector circuit malfunction, cylinder 2"),
    ("P0203", "Injector circuit malfunction, cylinder 3"),
    ("P0204", "Injector circuit malfunction, cylinder 4"),
    ("P0299", "Turbocharger underboost"),
    ("P0401", "Exhaust gas recirculation flow insufficient"),
    ("P0420", "Catalyst system efficiency below threshold (bank 1)"),
    ("P0470", "Exhaust pressure sensor malfunction"),
    ("P0670", "Glow plug module control circuit"),
    ("P1435", "Particulate filter additive level too low"),
    ("P2002", "Particulate filter efficiency below threshold (bank 1)"),
    ("P2031", "Exhaust gas temperature sensor circuit (bank 1, sensor 2)"),
    ("P2452", "Particulate filter pressure sensor circuit"),
    ("P2463", "Particulate filter soot accumulation excessive"),
    ("C1381", "Wheel speed sensor signal implausible"),
    ("U0073", "Control module communication bus off"),
    ("U1108", "Lost communication with body computer"),
];

/// Catalog text for a 5-character trouble code
pub fn dtc_description(code: &str) -> Option<&'static str> {
    DTC_DESCRIPTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, d)| *d)
}
