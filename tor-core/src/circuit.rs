//! Circuit plane: per-hop key state, layered cell encryption with
//! persistent running digests, and circuit construction via CREATE2/EXTEND2.

use sha1::{Digest, Sha1};

use crate::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use crate::crypto::{CellCipher, CryptoProvider};
use crate::error::{Result, TorError};
use crate::ntor::{ClientHandshake, NtorKeys};

/// Maximum `RELAY_EARLY` cells sent per circuit before falling back to
/// plain `RELAY`, matching Tor's anti-fingerprinting guidance.
pub const MAX_RELAY_EARLY_CELLS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Building,
    Ready,
    Destroyed,
}

/// One hop's key state. The forward/backward digests are persistent,
/// incrementally-updated SHA-1 hashers — never recomputed from scratch —
/// so the running digest after N cells equals SHA-1 of their concatenated
/// plaintexts.
pub struct Hop {
    pub identity: [u8; 20],
    forward_cipher: CellCipher,
    backward_cipher: CellCipher,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl Hop {
    fn from_keys(identity: [u8; 20], keys: NtorKeys) -> Self {
        let zero_iv = [0u8; 16];
        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest_seed);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest_seed);

        Self {
            identity,
            forward_cipher: CellCipher::new(&keys.forward_key, &zero_iv),
            backward_cipher: CellCipher::new(&keys.backward_key, &zero_iv),
            forward_digest,
            backward_digest,
        }
    }

    /// Digests `plaintext`, folds it into the running forward digest,
    /// and returns the digest's current 4-byte prefix (for embedding in
    /// the cell before encryption).
    fn update_forward_digest(&mut self, plaintext: &[u8]) -> [u8; 4] {
        self.forward_digest.update(plaintext);
        let snapshot = self.forward_digest.clone().finalize();
        [snapshot[0], snapshot[1], snapshot[2], snapshot[3]]
    }

    fn update_backward_digest(&mut self, plaintext: &[u8]) -> [u8; 4] {
        self.backward_digest.update(plaintext);
        let snapshot = self.backward_digest.clone().finalize();
        [snapshot[0], snapshot[1], snapshot[2], snapshot[3]]
    }

    pub fn forward_digest_snapshot(&self) -> [u8; 20] {
        self.forward_digest.clone().finalize().into()
    }

    pub fn backward_digest_snapshot(&self) -> [u8; 20] {
        self.backward_digest.clone().finalize().into()
    }
}

pub struct Circuit {
    pub id: u32,
    pub state: CircuitState,
    hops: Vec<Hop>,
    relay_early_sent: u32,
}

impl Circuit {
    /// `id` must have its most-significant bit set, per spec step 2 of
    /// circuit construction (client-initiated circuit IDs).
    pub fn new(id: u32) -> Self {
        debug_assert!(id & 0x8000_0000 != 0, "client circuit ids must have the MSB set");
        Self {
            id,
            state: CircuitState::Building,
            hops: Vec::new(),
            relay_early_sent: 0,
        }
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Completes a CREATE2/CREATED2 exchange for the first hop.
    pub fn create_first_hop(
        &mut self,
        handshake: ClientHandshake,
        created2_payload: &[u8],
        server_identity: [u8; 20],
        server_ntor_key: &[u8; 32],
    ) -> Result<()> {
        if !self.hops.is_empty() {
            return Err(TorError::protocol("create_first_hop called on non-empty circuit"));
        }
        let keys = handshake.complete(created2_payload, &server_identity, server_ntor_key)?;
        self.hops.push(Hop::from_keys(server_identity, keys));
        if self.hops.len() == 1 {
            self.state = CircuitState::Ready;
        }
        Ok(())
    }

    /// Completes an EXTEND2/EXTENDED2 exchange, appending a new hop.
    pub fn extend(
        &mut self,
        handshake: ClientHandshake,
        extended2_payload: &[u8],
        server_identity: [u8; 20],
        server_ntor_key: &[u8; 32],
    ) -> Result<()> {
        if self.hops.is_empty() {
            return Err(TorError::protocol("extend called before any hop exists"));
        }
        let keys = handshake.complete(extended2_payload, &server_identity, server_ntor_key)?;
        self.hops.push(Hop::from_keys(server_identity, keys));
        Ok(())
    }

    /// Builds the CREATE2 payload for the first hop and returns the
    /// in-progress handshake to complete once CREATED2 arrives.
    pub fn begin_create2(
        crypto: &dyn CryptoProvider,
        server_identity: &[u8; 20],
        server_ntor_key: &[u8; 32],
    ) -> (ClientHandshake, Vec<u8>) {
        let handshake = ClientHandshake::new(crypto);
        let payload = handshake.create2_payload(server_identity, server_ntor_key);
        (handshake, payload)
    }

    /// Wraps an EXTEND2 CREATE2-payload inside a RELAY_EARLY (or RELAY,
    /// once the per-circuit RELAY_EARLY budget is spent) cell targeting
    /// the last hop, per spec 4.5/SPEC_FULL 4.5.
    pub fn wrap_extend2(&mut self, stream_id: u16, link_specifiers: &[u8], create2_payload: &[u8]) -> Result<Cell> {
        if self.hops.is_empty() {
            return Err(TorError::protocol("cannot EXTEND2 before any hop exists"));
        }
        let mut data = Vec::with_capacity(link_specifiers.len() + create2_payload.len());
        data.extend_from_slice(link_specifiers);
        data.extend_from_slice(create2_payload);
        let relay_cell = RelayCell::new(RelayCommand::Extend2, stream_id, data);

        let command = if self.relay_early_sent < MAX_RELAY_EARLY_CELLS {
            self.relay_early_sent += 1;
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };

        let encrypted = self.encrypt_outgoing(relay_cell.to_bytes()?)?;
        Ok(Cell::new(self.id, command, encrypted))
    }

    /// Encrypts a relay-cell plaintext payload through every hop in
    /// forward order (spec 4.5 "Cell encryption (outgoing)"), folding
    /// each hop's contribution into its running forward digest first.
    pub fn encrypt_outgoing(&mut self, mut plaintext: Vec<u8>) -> Result<Vec<u8>> {
        if self.state != CircuitState::Ready && self.hops.is_empty() {
            return Err(TorError::protocol("circuit has no hops"));
        }
        for hop in self.hops.iter_mut() {
            let digest_prefix = hop.update_forward_digest(&plaintext);
            embed_digest(&mut plaintext, digest_prefix);
            hop.forward_cipher.apply_keystream(&mut plaintext);
        }
        Ok(plaintext)
    }

    /// Decrypts an incoming relay-cell ciphertext by peeling one AES-CTR
    /// layer per hop in forward order, stopping at the first hop whose
    /// `recognized` field reads 0 and whose rolling backward digest
    /// matches the embedded digest. Returns the decrypted relay cell and
    /// the index of the recognizing hop.
    pub fn decrypt_incoming(&mut self, mut ciphertext: Vec<u8>) -> Result<(RelayCell, usize)> {
        let mut recognized_at: Option<usize> = None;
        for (i, hop) in self.hops.iter_mut().enumerate() {
            hop.backward_cipher.apply_keystream(&mut ciphertext);
            let candidate = RelayCell::from_bytes(&ciphertext)?;
            if candidate.recognized != 0 {
                continue;
            }
            let expected = hop.update_backward_digest_with_zeroed_digest(&ciphertext);
            if expected == candidate.digest {
                if recognized_at.is_some() {
                    self.state = CircuitState::Destroyed;
                    return Err(TorError::protocol("ambiguous recognition: multiple hops matched"));
                }
                recognized_at = Some(i);
                break;
            }
        }
        match recognized_at {
            Some(i) => Ok((RelayCell::from_bytes(&ciphertext)?, i)),
            None => Err(TorError::protocol("no hop recognized incoming cell")),
        }
    }

    pub fn destroy(&mut self) {
        self.state = CircuitState::Destroyed;
    }
}

impl Hop {
    /// Computes the rolling backward digest treating the cell's own
    /// digest field as zero, matching Tor's recognized-cell check.
    fn update_backward_digest_with_zeroed_digest(&mut self, cell_bytes: &[u8]) -> [u8; 4] {
        let mut zeroed = cell_bytes.to_vec();
        zeroed[5..9].copy_from_slice(&[0, 0, 0, 0]);
        self.update_backward_digest(&zeroed)
    }
}

fn embed_digest(relay_cell_bytes: &mut [u8], digest_prefix: [u8; 4]) {
    relay_cell_bytes[5..9].copy_from_slice(&digest_prefix);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SystemCryptoProvider;
    use sha1::{Digest as _, Sha1};

    fn dummy_keys(seed: u8) -> NtorKeys {
        NtorKeys {
            forward_digest_seed: [seed; 20],
            backward_digest_seed: [seed.wrapping_add(1); 20],
            forward_key: [seed; 16],
            backward_key: [seed.wrapping_add(1); 16],
        }
    }

    #[test]
    fn running_forward_digest_matches_concatenated_plaintexts() {
        let mut circuit = Circuit::new(0x8000_0001);
        circuit.hops.push(Hop::from_keys([1u8; 20], dummy_keys(7)));

        let mut concatenated = Vec::new();
        let mut expected_hasher = Sha1::new();
        expected_hasher.update(dummy_keys(7).forward_digest_seed);

        for i in 0..3u8 {
            let plaintext = vec![i; Cell::PAYLOAD_SIZE];
            concatenated.extend_from_slice(&plaintext);
            expected_hasher.update(&plaintext);
            circuit.encrypt_outgoing(plaintext).unwrap();
        }

        let expected: [u8; 20] = expected_hasher.finalize().into();
        assert_eq!(circuit.hops[0].forward_digest_snapshot(), expected);
    }

    #[test]
    fn circuit_id_requires_msb_set() {
        let circuit = Circuit::new(0x8000_0042);
        assert_eq!(circuit.id & 0x8000_0000, 0x8000_0000);
    }

    #[test]
    fn relay_early_budget_falls_back_to_relay() {
        let mut circuit = Circuit::new(0x8000_0001);
        circuit.hops.push(Hop::from_keys([1u8; 20], dummy_keys(3)));

        let mut saw_plain_relay = false;
        for _ in 0..MAX_RELAY_EARLY_CELLS + 1 {
            let cell = circuit.wrap_extend2(0, &[], &[0u8; 4]).unwrap();
            if cell.command == CellCommand::Relay {
                saw_plain_relay = true;
            }
        }
        assert!(saw_plain_relay);
    }

    #[test]
    fn create_first_hop_rejects_wrong_sized_created2() {
        let crypto = SystemCryptoProvider;
        let (handshake, _payload) = Circuit::begin_create2(&crypto, &[0u8; 20], &[0u8; 32]);
        let mut circuit = Circuit::new(0x8000_0001);
        let result = circuit.create_first_hop(handshake, &[0u8; 10], [0u8; 20], &[0u8; 32]);
        assert!(result.is_err());
    }
}
