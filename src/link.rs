//! Cell framing over a [`Duplex`] transport session.
//!
//! Fixed cells are always `circ_id_width + 1 + Cell::PAYLOAD_SIZE` bytes;
//! variable-length cells (VERSIONS, CERTS, ...) carry an explicit 2-byte
//! length field right after the command byte. `CellLink` reads exactly
//! enough bytes to know which shape it has before asking
//! [`Cell::from_bytes`] to decode the rest, so it never over-reads past
//! one cell on the wire.
//!
//! Circuit-id width starts at 4 (this client never speaks a link
//! version below 4 once negotiated) but VERSIONS cells predate that
//! negotiation and always use a 2-byte circuit id — callers doing the
//! link handshake toggle it with [`CellLink::use_pre_negotiation_circ_ids`]
//! for that one exchange.

use futures::io::{AsyncReadExt, AsyncWriteExt};
use torclient_core::cell::{Cell, CellCommand};
use torclient_core::error::{Result, TorError};
use torclient_core::Duplex;

pub struct CellLink<D> {
    inner: D,
    circ_id_width: u8,
}

impl<D: Duplex> CellLink<D> {
    pub fn new(inner: D) -> Self {
        Self { inner, circ_id_width: 4 }
    }

    /// VERSIONS is the only cell sent/received before a link version is
    /// negotiated, and always carries a 2-byte circuit id.
    pub fn use_pre_negotiation_circ_ids(&mut self) {
        self.circ_id_width = 2;
    }

    /// Switches back to the normal 4-byte circuit id once VERSIONS has
    /// been exchanged and a link version >= 4 negotiated.
    pub fn use_negotiated_circ_ids(&mut self) {
        self.circ_id_width = 4;
    }

    pub async fn send_cell(&mut self, cell: &Cell) -> Result<()> {
        let bytes = cell.to_bytes(self.circ_id_width)?;
        self.inner
            .write_all(&bytes)
            .await
            .map_err(|e| TorError::transport(format!("cell write failed: {e}")))?;
        Ok(())
    }

    /// Reads one cell. Fixed cells are a known length; variable-length
    /// cells need their length field read first, so this always reads
    /// the `circ_id_width + 1` header bytes up front and then decides.
    pub async fn recv_cell(&mut self) -> Result<Cell> {
        let mut header = vec![0u8; self.circ_id_width as usize + 1];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(|e| TorError::transport(format!("cell read failed: {e}")))?;

        let command_byte = header[self.circ_id_width as usize];
        let command = CellCommand::from_u8(command_byte)
            .ok_or_else(|| TorError::protocol(format!("unknown cell command {command_byte}")))?;

        let mut buf = header.clone();
        if command.is_variable_length() {
            let mut len_bytes = [0u8; 2];
            self.inner
                .read_exact(&mut len_bytes)
                .await
                .map_err(|e| TorError::transport(format!("cell length read failed: {e}")))?;
            let len = u16::from_be_bytes(len_bytes) as usize;
            buf.extend_from_slice(&len_bytes);
            let mut payload = vec![0u8; len];
            self.inner
                .read_exact(&mut payload)
                .await
                .map_err(|e| TorError::transport(format!("cell payload read failed: {e}")))?;
            buf.extend_from_slice(&payload);
        } else {
            let mut payload = vec![0u8; Cell::PAYLOAD_SIZE];
            self.inner
                .read_exact(&mut payload)
                .await
                .map_err(|e| TorError::transport(format!("cell payload read failed: {e}")))?;
            buf.extend_from_slice(&payload);
        }

        let (cell, _) = Cell::from_bytes(&buf, self.circ_id_width)?;
        Ok(cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::io::Cursor;

    #[test]
    fn round_trips_a_fixed_cell_through_a_duplex_pipe() {
        let cell = Cell::new(0x8000_0001, CellCommand::Create2, vec![7u8; Cell::PAYLOAD_SIZE]);
        let bytes = cell.to_bytes(4).unwrap();

        let mut link = CellLink::new(Cursor::new(bytes));
        let decoded = block_on(link.recv_cell()).unwrap();
        assert_eq!(decoded.circuit_id, cell.circuit_id);
        assert_eq!(decoded.command, CellCommand::Create2);
        assert_eq!(decoded.payload, cell.payload);
    }

    #[test]
    fn round_trips_a_variable_length_cell_with_negotiated_circ_ids() {
        let cell = Cell::new(0x8000_0002, CellCommand::Certs, vec![0xAB; 300]);
        let bytes = cell.to_bytes(4).unwrap();

        let mut link = CellLink::new(Cursor::new(bytes));
        let decoded = block_on(link.recv_cell()).unwrap();
        assert_eq!(decoded.command, CellCommand::Certs);
        assert_eq!(decoded.payload, vec![0xAB; 300]);
    }

    #[test]
    fn versions_cell_round_trips_with_pre_negotiation_circ_ids() {
        let cell = Cell::new(0x1234, CellCommand::Versions, vec![0, 3, 0, 4]);
        let bytes = cell.to_bytes(2).unwrap();

        let mut link = CellLink::new(Cursor::new(bytes));
        link.use_pre_negotiation_circ_ids();
        let decoded = block_on(link.recv_cell()).unwrap();
        assert_eq!(decoded.circuit_id, 0x1234);
        assert_eq!(decoded.command, CellCommand::Versions);
        assert_eq!(decoded.payload, vec![0, 3, 0, 4]);
    }

    #[test]
    fn switches_back_to_four_byte_circ_ids_after_negotiation() {
        let versions = Cell::new(0, CellCommand::Versions, vec![0, 4]);
        let mut wire = versions.to_bytes(2).unwrap();
        let netinfo = Cell::new(0x8000_0003, CellCommand::Netinfo, vec![9u8; Cell::PAYLOAD_SIZE]);
        wire.extend(netinfo.to_bytes(4).unwrap());

        let mut link = CellLink::new(Cursor::new(wire));
        link.use_pre_negotiation_circ_ids();
        let first = block_on(link.recv_cell()).unwrap();
        assert_eq!(first.command, CellCommand::Versions);

        link.use_negotiated_circ_ids();
        let second = block_on(link.recv_cell()).unwrap();
        assert_eq!(second.command, CellCommand::Netinfo);
        assert_eq!(second.circuit_id, 0x8000_0003);
    }
}
