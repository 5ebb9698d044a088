//! Tor cell wire format: fixed 514-byte cells, and variable-length cells
//! (command >= 128, or VERSIONS) with an explicit 2-byte length field.

use crate::cursor::{Reader, Writer};
use crate::error::{Result, TorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    Versions = 7,
    Netinfo = 8,
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
    PaddingNegotiate = 12,
    Vpadding = 128,
    Certs = 129,
    AuthChallenge = 130,
    Authenticate = 131,
    Authorize = 132,
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        Some(match cmd {
            0 => Self::Padding,
            1 => Self::Create,
            2 => Self::Created,
            3 => Self::Relay,
            4 => Self::Destroy,
            5 => Self::CreateFast,
            6 => Self::CreatedFast,
            7 => Self::Versions,
            8 => Self::Netinfo,
            9 => Self::RelayEarly,
            10 => Self::Create2,
            11 => Self::Created2,
            12 => Self::PaddingNegotiate,
            128 => Self::Vpadding,
            129 => Self::Certs,
            130 => Self::AuthChallenge,
            131 => Self::Authenticate,
            132 => Self::Authorize,
            _ => return None,
        })
    }

    /// VERSIONS is the only variable-length cell allowed to carry a
    /// 2-byte circ-id (pre link-version negotiation); every other
    /// variable-length cell and all fixed cells use 4-byte circ-ids.
    pub fn is_variable_length(self) -> bool {
        self as u8 >= 128 || matches!(self, CellCommand::Versions)
    }
}

#[derive(Debug, Clone)]
pub struct Cell {
    pub circuit_id: u32,
    pub command: CellCommand,
    pub payload: Vec<u8>,
}

impl Cell {
    pub const SIZE: usize = 514;
    pub const PAYLOAD_SIZE: usize = 509;

    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, relay_payload)
    }

    /// Encodes a cell. Uses the fixed 514-byte layout unless the command
    /// requires variable length, in which case a 2-byte length field
    /// follows the command byte and the payload is not padded.
    pub fn to_bytes(&self, circ_id_width: u8) -> Result<Vec<u8>> {
        let mut w = Writer::with_capacity(Cell::SIZE);
        write_circ_id(&mut w, self.circuit_id, circ_id_width);
        w.write_u8(self.command as u8);

        if self.command.is_variable_length() {
            w.write_vec(2, &self.payload)?;
        } else {
            if self.payload.len() > Cell::PAYLOAD_SIZE {
                return Err(TorError::protocol("payload exceeds fixed cell size"));
            }
            w.write_bytes(&self.payload);
            let written = w.as_slice().len();
            let target = circ_id_width as usize + 1 + Cell::PAYLOAD_SIZE;
            for _ in written..target {
                w.write_u8(0);
            }
        }
        Ok(w.into_bytes())
    }

    /// Decodes one cell from `data`, returning the cell and the number of
    /// bytes consumed. `circ_id_width` is 2 before link-version
    /// negotiation and 4 afterward.
    pub fn from_bytes(data: &[u8], circ_id_width: u8) -> Result<(Self, usize)> {
        let mut r = Reader::new(data);
        let circuit_id = read_circ_id(&mut r, circ_id_width)?;
        let command_byte = r.read_u8()?;
        let command = CellCommand::from_u8(command_byte)
            .ok_or_else(|| TorError::protocol(format!("unknown cell command {command_byte}")))?;

        if command.is_variable_length() {
            let payload = r.read_vec(2)?.to_vec();
            Ok((
                Self {
                    circuit_id,
                    command,
                    payload,
                },
                r.pos(),
            ))
        } else {
            let payload = r.read_bytes(Cell::PAYLOAD_SIZE)?.to_vec();
            Ok((
                Self {
                    circuit_id,
                    command,
                    payload,
                },
                r.pos(),
            ))
        }
    }
}

fn write_circ_id(w: &mut Writer, circuit_id: u32, width: u8) {
    if width == 2 {
        w.write_u16(circuit_id as u16);
    } else {
        w.write_u32(circuit_id);
    }
}

fn read_circ_id(r: &mut Reader, width: u8) -> Result<u32> {
    if width == 2 {
        Ok(r.read_u16()? as u32)
    } else {
        r.read_u32()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Extend = 6,
    Extended = 7,
    Truncate = 8,
    Truncated = 9,
    Drop = 10,
    Resolve = 11,
    Resolved = 12,
    BeginDir = 13,
    Extend2 = 14,
    Extended2 = 15,
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        Some(match cmd {
            1 => Self::Begin,
            2 => Self::Data,
            3 => Self::End,
            4 => Self::Connected,
            5 => Self::Sendme,
            6 => Self::Extend,
            7 => Self::Extended,
            8 => Self::Truncate,
            9 => Self::Truncated,
            10 => Self::Drop,
            11 => Self::Resolve,
            12 => Self::Resolved,
            13 => Self::BeginDir,
            14 => Self::Extend2,
            15 => Self::Extended2,
            _ => return None,
        })
    }
}

/// The payload of a RELAY/RELAY_EARLY cell, after one layer of onion
/// decryption has "recognized" it as addressed to this hop.
#[derive(Debug, Clone)]
pub struct RelayCell {
    pub command: RelayCommand,
    pub recognized: u16,
    pub stream_id: u16,
    pub digest: [u8; 4],
    pub data: Vec<u8>,
}

impl RelayCell {
    pub const MAX_DATA_SIZE: usize = 498;
    const HEADER_LEN: usize = 11;

    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Encodes into exactly `Cell::PAYLOAD_SIZE` bytes (zero-padded).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::protocol("relay cell data too large"));
        }
        let mut w = Writer::with_capacity(Cell::PAYLOAD_SIZE);
        w.write_u8(self.command as u8);
        w.write_u16(self.recognized);
        w.write_u16(self.stream_id);
        w.write_bytes(&self.digest);
        w.write_u16(self.data.len() as u16);
        w.write_bytes(&self.data);
        while w.as_slice().len() < Cell::PAYLOAD_SIZE {
            w.write_u8(0);
        }
        Ok(w.into_bytes())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_LEN {
            return Err(TorError::protocol("relay cell too short"));
        }
        let mut r = Reader::new(data);
        let command_byte = r.read_u8()?;
        let command = RelayCommand::from_u8(command_byte)
            .ok_or_else(|| TorError::protocol(format!("unknown relay command {command_byte}")))?;
        let recognized = r.read_u16()?;
        let stream_id = r.read_u16()?;
        let digest_bytes = r.read_bytes(4)?;
        let digest = [digest_bytes[0], digest_bytes[1], digest_bytes[2], digest_bytes[3]];
        let length = r.read_u16()? as usize;
        if length > Self::MAX_DATA_SIZE {
            return Err(TorError::protocol("relay cell declares oversized length"));
        }
        let payload = r.read_bytes(length)?.to_vec();
        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_cell_round_trips_for_every_command() {
        for cmd in [
            CellCommand::Padding,
            CellCommand::Create2,
            CellCommand::Created2,
            CellCommand::Relay,
            CellCommand::RelayEarly,
            CellCommand::Destroy,
            CellCommand::Netinfo,
        ] {
            let cell = Cell::new(0x8000_0001, cmd, vec![1, 2, 3, 4]);
            let bytes = cell.to_bytes(4).unwrap();
            assert_eq!(bytes.len(), Cell::SIZE);
            let (parsed, consumed) = Cell::from_bytes(&bytes, 4).unwrap();
            assert_eq!(consumed, Cell::SIZE);
            assert_eq!(parsed.circuit_id, 0x8000_0001);
            assert_eq!(parsed.command as u8, cmd as u8);
        }
    }

    #[test]
    fn variable_length_cell_round_trips() {
        let payload = vec![0xAB; 300];
        let cell = Cell::new(7, CellCommand::Certs, payload.clone());
        let bytes = cell.to_bytes(4).unwrap();
        assert_eq!(bytes.len(), 4 + 1 + 2 + payload.len());
        let (parsed, consumed) = Cell::from_bytes(&bytes, 4).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn versions_cell_uses_two_byte_circ_id() {
        let cell = Cell::new(0x1234, CellCommand::Versions, vec![0, 3, 0, 4]);
        let bytes = cell.to_bytes(2).unwrap();
        assert_eq!(&bytes[0..2], &[0x12, 0x34]);
        let (parsed, _) = Cell::from_bytes(&bytes, 2).unwrap();
        assert_eq!(parsed.circuit_id, 0x1234);
    }

    #[test]
    fn relay_cell_round_trips() {
        let relay = RelayCell::new(RelayCommand::Begin, 100, vec![5, 6, 7]);
        let bytes = relay.to_bytes().unwrap();
        assert_eq!(bytes.len(), Cell::PAYLOAD_SIZE);
        let parsed = RelayCell::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.command as u8, RelayCommand::Begin as u8);
        assert_eq!(parsed.stream_id, 100);
        assert_eq!(parsed.data, vec![5, 6, 7]);
    }

    #[test]
    fn relay_cell_rejects_oversized_declared_length() {
        let mut bytes = vec![0u8; Cell::PAYLOAD_SIZE];
        bytes[0] = RelayCommand::Data as u8;
        bytes[9] = 0xFF;
        bytes[10] = 0xFF;
        assert!(RelayCell::from_bytes(&bytes).is_err());
    }
}
