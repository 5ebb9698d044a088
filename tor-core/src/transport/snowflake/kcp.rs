//! KCP: a selective-ACK reliability layer carried inside Turbo frames.
//! Wire format (all integers little-endian, per the Snowflake/KCP spec):
//! `conversation(4) command(1) frg(1) wnd(2) ts(4) sn(4) una(4) len(4) data(len)`.

use std::collections::BTreeMap;

use crate::clock::{Clock, Instant};
use crate::error::{Result, TorError};

pub const MTU: usize = 1400;
pub const WINDOW: u16 = 32;
pub const INTERVAL_LOW_MS: u64 = 100;
pub const INTERVAL_HIGH_MS: u64 = 1000;

const HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KcpCommand {
    Push = 81,
    Ack = 82,
    AskWindow = 83,
    TellWindow = 84,
}

impl KcpCommand {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            81 => Self::Push,
            82 => Self::Ack,
            83 => Self::AskWindow,
            84 => Self::TellWindow,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KcpSegment {
    pub conversation: u32,
    pub command: KcpCommand,
    pub fragment: u8,
    pub window: u16,
    pub timestamp: u32,
    pub serial_number: u32,
    pub unacknowledged: u32,
    pub data: Vec<u8>,
}

impl KcpSegment {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.conversation.to_le_bytes());
        out.push(self.command as u8);
        out.push(self.fragment);
        out.extend_from_slice(&self.window.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.serial_number.to_le_bytes());
        out.extend_from_slice(&self.unacknowledged.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < HEADER_LEN {
            return Err(TorError::parse("kcp segment shorter than header"));
        }
        let conversation = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let command_byte = data[4];
        let command = KcpCommand::from_u8(command_byte)
            .ok_or_else(|| TorError::parse(format!("unknown kcp command {command_byte}")))?;
        let fragment = data[5];
        let window = u16::from_le_bytes(data[6..8].try_into().unwrap());
        let timestamp = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let serial_number = u32::from_le_bytes(data[12..16].try_into().unwrap());
        let unacknowledged = u32::from_le_bytes(data[16..20].try_into().unwrap());
        let len = u32::from_le_bytes(data[20..24].try_into().unwrap()) as usize;
        if HEADER_LEN + len > data.len() {
            return Err(TorError::parse("kcp segment data truncated"));
        }
        let payload = data[HEADER_LEN..HEADER_LEN + len].to_vec();
        Ok((
            Self {
                conversation,
                command,
                fragment,
                window,
                timestamp,
                serial_number,
                unacknowledged,
                data: payload,
            },
            HEADER_LEN + len,
        ))
    }
}

struct PendingSend {
    segment: KcpSegment,
    last_sent: Option<Instant>,
    acked: bool,
}

/// A simplified reliable session: slices outbound data into `Push`
/// segments bounded by `MTU`, tracks per-segment ACKs, retransmits
/// unacked segments after an RTO window, and reassembles received
/// fragments into an ordered byte stream.
pub struct KcpSession<C: Clock> {
    conversation: u32,
    clock: std::sync::Arc<C>,
    next_send_sn: u32,
    next_recv_sn: u32,
    unacked: Vec<PendingSend>,
    recv_buffer: BTreeMap<u32, Vec<u8>>,
    delivered: Vec<u8>,
    rto: std::time::Duration,
}

impl<C: Clock> KcpSession<C> {
    pub fn new(conversation: u32, clock: std::sync::Arc<C>) -> Self {
        Self {
            conversation,
            clock,
            next_send_sn: 0,
            next_recv_sn: 0,
            unacked: Vec::new(),
            recv_buffer: BTreeMap::new(),
            delivered: Vec::new(),
            rto: std::time::Duration::from_millis(INTERVAL_LOW_MS),
        }
    }

    /// Queues `data` for sending, split into `MTU`-sized push segments.
    pub fn send(&mut self, data: &[u8]) {
        let chunks: Vec<&[u8]> = data.chunks(MTU - HEADER_LEN).collect();
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let segment = KcpSegment {
                conversation: self.conversation,
                command: KcpCommand::Push,
                fragment: (count - 1 - i) as u8,
                window: WINDOW,
                timestamp: self.clock.now().as_millis() as u32,
                serial_number: self.next_send_sn,
                unacknowledged: self.next_recv_sn,
                data: chunk.to_vec(),
            };
            self.next_send_sn += 1;
            self.unacked.push(PendingSend {
                segment,
                last_sent: None,
                acked: false,
            });
        }
    }

    /// Encodes every segment due to go out now: unsent segments plus any
    /// unacked segment whose RTO has elapsed.
    pub fn flush(&mut self) -> Vec<Vec<u8>> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for pending in self.unacked.iter_mut() {
            if pending.acked {
                continue;
            }
            let due = match pending.last_sent {
                None => true,
                Some(last) => now.saturating_sub(last) >= self.rto,
            };
            if due {
                pending.last_sent = Some(now);
                out.push(pending.segment.encode());
            }
        }
        self.unacked.retain(|p| !p.acked);
        out
    }

    /// Feeds one decoded incoming segment into the session: applies an
    /// ACK, or buffers/delivers push data, reassembling fragments so
    /// `take_received` yields bytes in send order.
    pub fn input(&mut self, segment: KcpSegment) {
        match segment.command {
            KcpCommand::Ack => {
                for pending in self.unacked.iter_mut() {
                    if pending.segment.serial_number == segment.serial_number {
                        pending.acked = true;
                    }
                }
            }
            KcpCommand::Push => {
                self.recv_buffer.insert(segment.serial_number, segment.data);
                while let Some(chunk) = self.recv_buffer.remove(&self.next_recv_sn) {
                    self.delivered.extend_from_slice(&chunk);
                    self.next_recv_sn += 1;
                }
            }
            _ => {}
        }
    }

    /// Builds the ACK segment to send in response to an incoming push
    /// with the given serial number.
    pub fn ack_for(&self, serial_number: u32) -> KcpSegment {
        KcpSegment {
            conversation: self.conversation,
            command: KcpCommand::Ack,
            fragment: 0,
            window: WINDOW,
            timestamp: self.clock.now().as_millis() as u32,
            serial_number,
            unacknowledged: self.next_recv_sn,
            data: Vec::new(),
        }
    }

    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.delivered)
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.iter().filter(|p| !p.acked).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::Arc;

    #[test]
    fn segment_round_trips() {
        let seg = KcpSegment {
            conversation: 0xAABBCCDD,
            command: KcpCommand::Push,
            fragment: 3,
            window: 32,
            timestamp: 123456,
            serial_number: 7,
            unacknowledged: 2,
            data: b"snowflake payload".to_vec(),
        };
        let bytes = seg.encode();
        let (decoded, consumed) = KcpSegment::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, seg);
    }

    #[test]
    fn session_reassembles_fragmented_data_in_order() {
        let clock = Arc::new(VirtualClock::new());
        let mut sender = KcpSession::new(1, clock.clone());
        let mut receiver = KcpSession::new(1, clock);

        let payload = vec![0x5Au8; MTU * 2];
        sender.send(&payload);
        for wire in sender.flush() {
            let (seg, _) = KcpSegment::decode(&wire).unwrap();
            receiver.input(seg);
        }
        assert_eq!(receiver.take_received(), payload);
    }

    #[test]
    fn unacked_segment_is_retransmitted_after_rto() {
        let clock = Arc::new(VirtualClock::new());
        let mut sender = KcpSession::new(1, clock.clone());
        sender.send(b"hello");
        let first_flush = sender.flush();
        assert_eq!(first_flush.len(), 1);

        // Nothing new to send immediately.
        assert!(sender.flush().is_empty());

        clock.advance(std::time::Duration::from_millis(INTERVAL_LOW_MS));
        let retransmit = sender.flush();
        assert_eq!(retransmit.len(), 1);
        assert_eq!(retransmit[0], first_flush[0]);
    }

    #[test]
    fn ack_clears_unacked_segment() {
        let clock = Arc::new(VirtualClock::new());
        let mut sender = KcpSession::new(1, clock);
        sender.send(b"hello");
        sender.flush();
        assert_eq!(sender.unacked_count(), 1);
        sender.input(KcpSegment {
            conversation: 1,
            command: KcpCommand::Ack,
            fragment: 0,
            window: WINDOW,
            timestamp: 0,
            serial_number: 0,
            unacknowledged: 1,
            data: Vec::new(),
        });
        assert_eq!(sender.unacked_count(), 0);
    }
}
