//! KWP2000 (ISO 14230) compatibility client
//!
//! Some older control units on the same ISO-TP link only answer the KWP
//! service set. This client rides the same adapter gate and codec as the
//! UDS path but speaks the KWP variants: 2-byte DTC records from service
//! 0x18, `FF 00` group selectors, and the KWP session id space.
//!
//! The orchestration layer stays UDS; this exists for callers that know
//! their target is KWP-only.

use std::time::Duration;

use log::debug;

use crate::{
    adapter::AdapterLink,
    isotp,
    transport::MAX_READ_DEADLINE,
    DiagError, DiagResult,
};

/// KWP service ids this client speaks
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum KwpCommand {
    /// Start or change the diagnostic session (0x10)
    StartDiagnosticSession = 0x10,
    /// Clear diagnostic information (0x14)
    ClearDiagnosticInformation = 0x14,
    /// Read DTCs by status (0x18)
    ReadDtcByStatus = 0x18,
    /// Session heartbeat (0x3E)
    TesterPresent = 0x3E,
}

impl From<KwpCommand> for u8 {
    fn from(cmd: KwpCommand) -> Self {
        cmd as u8
    }
}

/// KWP diagnostic session modes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KwpSession {
    /// Normal operation (0x81)
    Normal,
    /// Extended diagnostics (0x92)
    ExtendedDiagnostics,
    /// Manufacturer specific mode
    Custom(u8),
}

impl From<KwpSession> for u8 {
    fn from(s: KwpSession) -> Self {
        match s {
            KwpSession::Normal => 0x81,
            KwpSession::ExtendedDiagnostics => 0x92,
            KwpSession::Custom(x) => x,
        }
    }
}

/// A KWP DTC: 2-byte number plus its status byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KwpDtc {
    /// Raw 16-bit DTC number
    pub raw: u16,
    /// KWP status byte
    pub status: u8,
}

impl KwpDtc {
    /// Textual form: system letter from the top two bits, then the
    /// remaining 14 bits as four hex digits.
    pub fn name(&self) -> String {
        let system = match self.raw >> 14 {
            0b00 => 'P',
            0b01 => 'C',
            0b10 => 'B',
            _ => 'U',
        };
        format!("{}{:04X}", system, self.raw & 0x3FFF)
    }
}

/// KWP2000 client over the adapter gate
#[derive(Clone)]
pub struct Kwp2000Client {
    link: AdapterLink,
}

impl Kwp2000Client {
    pub fn new(link: AdapterLink) -> Self {
        Self { link }
    }

    /// Sends one service request, returns the positive payload with SID
    pub fn request(
        &self,
        service: KwpCommand,
        args: &[u8],
        deadline: Option<Duration>,
    ) -> DiagResult<Vec<u8>> {
        let sid: u8 = service.into();
        let mut line = format!("{sid:02X}");
        for b in args {
            line.push_str(&format!("{b:02X}"));
        }
        debug!("kwp request {line}");
        let reply = self.link.exchange(&line, deadline)?;
        let payload = isotp::parse_response(&reply)?;
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

    /// Service 0x10: set the KWP session mode
    pub fn start_session(&self, session: KwpSession) -> DiagResult<()> {
        self.request(KwpCommand::StartDiagnosticSession, &[session.into()], None)
            .map(|_| ())
    }

    /// Service 0x3E in the response-required form
    pub fn tester_present(&self) -> DiagResult<()> {
        self.request(KwpCommand::TesterPresent, &[0x01], None)
            .map(|_| ())
    }

    /// Service 0x18 0x02 over all groups: stored DTCs with status
    pub fn read_stored_dtcs(&self) -> DiagResult<Vec<KwpDtc>> {
        let resp = self.request(
            KwpCommand::ReadDtcByStatus,
            &[0x02, 0xFF, 0x00],
            Some(MAX_READ_DEADLINE),
        )?;
        // 58 <count> then 3-byte records
        if resp.len() < 2 {
            return Err(DiagError::InvalidResponseLength);
        }
        let records = &resp[2..];
        if records.len() % 3 != 0 {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(records
            .chunks_exact(3)
            .map(|c| KwpDtc {
                raw: ((c[0] as u16) << 8) | c[1] as u16,
                status: c[2],
            })
            .collect())
    }

    /// Service 0x14 over all groups: success iff the ECU answers `54`
    pub fn clear_diagnostic_information(&self) -> DiagResult<()> {
        self.request(
            KwpCommand::ClearDiagnosticInformation,
            &[0xFF, 0x00],
            Some(MAX_READ_DEADLINE),
        )
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kwp_dtc_naming() {
        let dtc = KwpDtc {
            raw: 0x0420,
            status: 0xE0,
        };
        assert_eq!(dtc.name(), "P0420");
        let dtc = KwpDtc {
            raw: 0x4100,
            status: 0x00,
        };
        assert_eq!(dtc.name(), "C0100");
    }

    #[test]
    fn session_bytes() {
        assert_eq!(u8::from(KwpSession::Normal), 0x81);
        assert_eq!(u8::from(KwpSession::ExtendedDiagnostics), 0x92);
        assert_eq!(u8::from(KwpSession::Custom(0x93)), 0x93);
    }
}
