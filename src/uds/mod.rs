//! UDS (ISO 14229) client: request encoding and response classification
//!
//! Requests go out as upper-case hex lines through the adapter gate;
//! replies come back through the ISO-TP codec. The client checks the
//! positive-response id (`request SID + 0x40`), surfaces negative responses
//! untouched and verifies that data responses echo what was asked for.

use std::time::Duration;

use log::debug;

use crate::{
    adapter::AdapterLink,
    isotp,
    transport::MAX_READ_DEADLINE,
    DiagError, DiagResult,
};

/// UDS service ids this tester speaks
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum UdsCommand {
    /// Start or change the diagnostic session (0x10)
    DiagnosticSessionControl = 0x10,
    /// Clear stored diagnostic information (0x14)
    ClearDiagnosticInformation = 0x14,
    /// Read DTC information (0x19)
    ReadDtcInformation = 0x19,
    /// Read data by 16-bit identifier (0x22)
    ReadDataByIdentifier = 0x22,
    /// Session heartbeat (0x3E)
    TesterPresent = 0x3E,
}

impl From<UdsCommand> for u8 {
    fn from(cmd: UdsCommand) -> Self {
        cmd as u8
    }
}

/// Diagnostic session states the engine distinguishes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UdsSession {
    /// How the ECU runs outside diagnostics; no heartbeat required
    Default,
    /// Unlocks the measurement and fault services; times out without
    /// TesterPresent
    Extended,
}

impl From<UdsSession> for u8 {
    fn from(s: UdsSession) -> Self {
        match s {
            UdsSession::Default => 0x01,
            UdsSession::Extended => 0x03,
        }
    }
}

/// Negative response codes, surfaced as received and never remapped
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UdsNrc {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrInvalidFormat,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    RequestCorrectlyReceivedResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    Other(u8),
}

impl From<u8> for UdsNrc {
    fn from(nrc: u8) -> Self {
        match nrc {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrInvalidFormat,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x78 => Self::RequestCorrectlyReceivedResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            x => Self::Other(x),
        }
    }
}

/// Raw `(high, low, status)` DTC record from a 0x19 0x02 reply
pub type DtcRecord = (u8, u8, u8);

/// Sub-function used for DTC reads: report DTCs by status mask
const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;

/// Status mask matching every DTC the ECU holds
const ALL_DTC_STATUS_MASK: u8 = 0xFF;

/// Group-of-DTC selector clearing everything
const ALL_DTC_GROUPS: u32 = 0xFFFFFF;

/// UDS client over the adapter gate
#[derive(Clone)]
pub struct UdsClient {
    link: AdapterLink,
}

impl UdsClient {
    pub fn new(link: AdapterLink) -> Self {
        Self { link }
    }

    /// Sends one service request and returns the positive-response payload
    /// including the response SID.
    pub fn request(
        &self,
        service: UdsCommand,
        args: &[u8],
        deadline: Option<Duration>,
    ) -> DiagResult<Vec<u8>> {
        let sid: u8 = service.into();
        let mut line = format!("{sid:02X}");
        for b in args {
            line.push_str(&format!("{b:02X}"));
        }
        debug!("uds request {line}");
        let reply = self.link.exchange(&line, deadline)?;
        let payload = isotp::parse_response(&reply)?;
        classify(sid, payload)
    }

    /// Service 0x10: switch the diagnostic session
    pub fn session_control(&self, session: UdsSession) -> DiagResult<()> {
        self.request(UdsCommand::DiagnosticSessionControl, &[session.into()], None)
            .map(|_| ())
    }

    /// Service 0x3E: keep the session alive
    pub fn tester_present(&self) -> DiagResult<()> {
        self.request(UdsCommand::TesterPresent, &[0x00], None)
            .map(|_| ())
    }

    /// Service 0x22: returns the data bytes with the `62 didHi didLo` echo
    /// stripped after verifying the echo matches `did`.
    pub fn read_data_by_identifier(&self, did: u16) -> DiagResult<Vec<u8>> {
        let resp = self.request(
            UdsCommand::ReadDataByIdentifier,
            &[(did >> 8) as u8, did as u8],
            None,
        )?;
        if resp.len() < 3 {
            return Err(DiagError::InvalidResponseLength);
        }
        let echoed = ((resp[1] as u16) << 8) | resp[2] as u16;
        if echoed != did {
            debug!("did echo mismatch: asked {did:04X}, got {echoed:04X}");
            return Err(DiagError::ProtocolMismatch);
        }
        Ok(resp[3..].to_vec())
    }

    /// Service 0x19 0x02 with mask 0xFF: returns the availability mask and
    /// the raw 3-byte records in on-wire order.
    pub fn read_dtc_information(&self) -> DiagResult<(u8, Vec<DtcRecord>)> {
        let resp = self.request(
            UdsCommand::ReadDtcInformation,
            &[REPORT_DTC_BY_STATUS_MASK, ALL_DTC_STATUS_MASK],
            Some(MAX_READ_DEADLINE),
        )?;
        if resp.len() < 3 {
            return Err(DiagError::InvalidResponseLength);
        }
        if resp[1] != REPORT_DTC_BY_STATUS_MASK {
            return Err(DiagError::ProtocolMismatch);
        }
        let mask = resp[2];
        let records = resp[3..]
            .chunks_exact(3)
            .map(|c| (c[0], c[1], c[2]))
            .collect();
        Ok((mask, records))
    }

    /// Service 0x14 for all groups: success iff the ECU answers `54`
    pub fn clear_diagnostic_information(&self) -> DiagResult<()> {
        self.request(
            UdsCommand::ClearDiagnosticInformation,
            &[
                (ALL_DTC_GROUPS >> 16) as u8,
                (ALL_DTC_GROUPS >> 8) as u8,
                ALL_DTC_GROUPS as u8,
            ],
            Some(MAX_READ_DEADLINE),
        )
        .map(|_| ())
    }
}

/// Splits positive from negative replies. `7F <sid> <nrc>` surfaces as
/// [DiagError::NegativeResponse]; a positive reply must carry
/// `sid + 0x40` first or the exchange is a mismatch.
fn classify(sid: u8, payload: Vec<u8>) -> DiagResult<Vec<u8>> {
    if payload.is_empty() {
        return Err(DiagError::NoData);
    }
    if payload[0] == 0x7F {
        if payload.len() < 3 {
            return Err(DiagError::InvalidResponseLength);
        }
        return Err(DiagError::NegativeResponse {
            service: payload[1],
            nrc: payload[2],
        });
    }
    if payload[0] != sid.wrapping_add(0x40) {
        return Err(DiagError::ProtocolMismatch);
    }
    Ok(payload)
}
