//! Builds a multi-hop circuit over a [`CellLink`] by running CREATE2
//! against the first hop and EXTEND2 against each hop after that,
//! exactly the sequence `Circuit` expects (see `tor-core`'s
//! `circuit.rs`): this module supplies the network round-trips, the
//! core crate supplies the cryptographic state machine.

use std::time::Duration;

use torclient_core::cell::{CellCommand, RelayCommand};
use torclient_core::circuit::Circuit;
use torclient_core::crypto::CryptoProvider;
use torclient_core::error::{Result, TorError};
use torclient_core::Duplex;

use crate::link::CellLink;

/// Legacy identity (SHA-1 fingerprint) link specifier type, per the
/// link-specifier TLV format used in EXTEND2 cells.
const LSTYPE_LEGACY_ID: u8 = 2;
const LSTYPE_TLS_IPV4: u8 = 0;

pub struct RelayDescriptor {
    pub identity: [u8; 20],
    pub ntor_key: [u8; 32],
    pub ipv4: [u8; 4],
    pub port: u16,
}

fn link_specifiers(relay: &RelayDescriptor) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * (2 + 20.max(6)) + 1);
    out.push(2); // NSPEC

    out.push(LSTYPE_TLS_IPV4);
    out.push(6);
    out.extend_from_slice(&relay.ipv4);
    out.extend_from_slice(&relay.port.to_be_bytes());

    out.push(LSTYPE_LEGACY_ID);
    out.push(20);
    out.extend_from_slice(&relay.identity);

    out
}

/// Builds a circuit by CREATE2-ing the first hop in `path` and then
/// EXTEND2-ing through the rest, in order. `timeout` bounds each
/// individual round-trip (spec: 30s total, enforced by the caller
/// racing this future against a clock timeout).
pub async fn build_circuit<D: Duplex>(
    link: &mut CellLink<D>,
    circuit_id: u32,
    path: &[RelayDescriptor],
    crypto: &dyn CryptoProvider,
) -> Result<Circuit> {
    if path.is_empty() {
        return Err(TorError::protocol("cannot build a circuit over an empty path"));
    }

    let mut circuit = Circuit::new(circuit_id);

    let first = &path[0];
    let (handshake, create2_payload) = Circuit::begin_create2(crypto, &first.identity, &first.ntor_key);
    link.send_cell(&torclient_core::cell::Cell::new(circuit_id, CellCommand::Create2, create2_payload))
        .await?;

    let created = link.recv_cell().await?;
    if created.command != CellCommand::Created2 {
        return Err(TorError::protocol(format!(
            "expected CREATED2, got {:?}",
            created.command
        )));
    }
    circuit.create_first_hop(handshake, &created.payload, first.identity, &first.ntor_key)?;
    log::info!("circuit {circuit_id:#x}: hop 1/{} ready", path.len());

    for (i, relay) in path.iter().enumerate().skip(1) {
        let (handshake, create2_payload) = Circuit::begin_create2(crypto, &relay.identity, &relay.ntor_key);
        let specifiers = link_specifiers(relay);
        let cell = circuit.wrap_extend2(0, &specifiers, &create2_payload)?;
        link.send_cell(&cell).await?;

        let reply = link.recv_cell().await?;
        if reply.command != CellCommand::Relay && reply.command != CellCommand::RelayEarly {
            return Err(TorError::protocol("expected a RELAY cell carrying EXTENDED2"));
        }
        let (relay_cell, _hop_idx) = circuit.decrypt_incoming(reply.payload)?;
        if relay_cell.command != RelayCommand::Extended2 {
            return Err(TorError::protocol(format!(
                "expected EXTENDED2, got {:?}",
                relay_cell.command
            )));
        }
        circuit.extend(handshake, &relay_cell.data, relay.identity, &relay.ntor_key)?;
        log::info!("circuit {circuit_id:#x}: hop {}/{} ready", i + 1, path.len());
    }

    Ok(circuit)
}

/// Default per-hop round-trip budget (spec §5 Timeouts: "individual
/// RELAY round-trip 10s").
pub const HOP_ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_specifiers_encode_nspec_and_both_entries() {
        let relay = RelayDescriptor {
            identity: [7u8; 20],
            ntor_key: [0u8; 32],
            ipv4: [1, 2, 3, 4],
            port: 443,
        };
        let encoded = link_specifiers(&relay);
        assert_eq!(encoded[0], 2);
        assert_eq!(encoded[1], LSTYPE_TLS_IPV4);
        assert_eq!(encoded[2], 6);
        assert_eq!(&encoded[3..7], &[1, 2, 3, 4]);
        assert_eq!(&encoded[7..9], &443u16.to_be_bytes());
        assert_eq!(encoded[9], LSTYPE_LEGACY_ID);
        assert_eq!(encoded[10], 20);
        assert_eq!(&encoded[11..31], &[7u8; 20]);
    }

    #[test]
    fn empty_path_is_rejected() {
        use futures::executor::block_on;
        use futures::io::Cursor;
        use torclient_core::crypto::SystemCryptoProvider;

        let mut link = CellLink::new(Cursor::new(Vec::<u8>::new()));
        let result = block_on(build_circuit(&mut link, 0x8000_0001, &[], &SystemCryptoProvider));
        assert!(result.is_err());
    }
}
