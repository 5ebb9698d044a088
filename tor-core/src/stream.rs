//! Per-stream state machine and sliding flow-control windows.

use crate::error::{Result, TorError};

pub const STREAM_PACKAGE_WINDOW: i32 = 500;
pub const STREAM_DELIVER_WINDOW: i32 = 50;
pub const CIRCUIT_PACKAGE_WINDOW: i32 = 1000;
pub const CIRCUIT_DELIVER_WINDOW: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Open,
    HalfClosed,
    Closed,
}

/// A sliding package/deliver window. `package` debits as we send data
/// and refills by a fixed increment on each SENDME; `deliver` debits as
/// we receive data and we emit a SENDME once it has dropped by the
/// refill increment, then refills.
pub struct FlowWindow {
    pub package: i32,
    pub deliver: i32,
    deliver_emitted_at: i32,
    package_increment: i32,
    deliver_increment: i32,
}

impl FlowWindow {
    pub fn stream_default() -> Self {
        Self {
            package: STREAM_PACKAGE_WINDOW,
            deliver: STREAM_DELIVER_WINDOW,
            deliver_emitted_at: STREAM_DELIVER_WINDOW,
            package_increment: 50,
            deliver_increment: 50,
        }
    }

    pub fn circuit_default() -> Self {
        Self {
            package: CIRCUIT_PACKAGE_WINDOW,
            deliver: CIRCUIT_DELIVER_WINDOW,
            deliver_emitted_at: CIRCUIT_DELIVER_WINDOW,
            package_increment: 100,
            deliver_increment: 100,
        }
    }

    /// Debits the package window for one outgoing data cell.
    pub fn debit_package(&mut self) -> Result<()> {
        self.package -= 1;
        if self.package < 0 {
            return Err(TorError::protocol("package window went negative"));
        }
        Ok(())
    }

    /// Applies an incoming SENDME: refills the package window.
    pub fn apply_sendme(&mut self) {
        self.package += self.package_increment;
    }

    /// Debits the deliver window for one incoming data cell. Returns
    /// `true` if a SENDME should now be emitted (deliver window has
    /// dropped by a full increment since the last SENDME).
    pub fn debit_deliver(&mut self) -> Result<bool> {
        self.deliver -= 1;
        if self.deliver < 0 {
            return Err(TorError::protocol("deliver window went negative"));
        }
        if self.deliver_emitted_at - self.deliver >= self.deliver_increment {
            self.deliver += self.deliver_increment;
            self.deliver_emitted_at = self.deliver;
            return Ok(true);
        }
        Ok(false)
    }
}

pub struct Stream {
    pub stream_id: u16,
    pub state: StreamState,
    pub window: FlowWindow,
}

impl Stream {
    pub fn new(stream_id: u16) -> Self {
        Self {
            stream_id,
            state: StreamState::Idle,
            window: FlowWindow::stream_default(),
        }
    }

    pub fn on_begin_sent(&mut self) -> Result<()> {
        self.require(StreamState::Idle)?;
        self.state = StreamState::Connecting;
        Ok(())
    }

    pub fn on_connected(&mut self) -> Result<()> {
        self.require(StreamState::Connecting)?;
        self.state = StreamState::Open;
        Ok(())
    }

    pub fn on_data(&mut self) -> Result<bool> {
        self.require(StreamState::Open)?;
        self.window.debit_deliver()
    }

    pub fn on_sendme(&mut self) -> Result<()> {
        self.require(StreamState::Open)?;
        self.window.apply_sendme();
        Ok(())
    }

    /// `RELAY_END` observed in `CONNECTING` goes straight to `Closed`;
    /// in `Open` it goes to `HalfClosed`; a second `RELAY_END` in
    /// `HalfClosed` closes it.
    pub fn on_end(&mut self) -> Result<()> {
        match self.state {
            StreamState::Connecting | StreamState::Idle => {
                self.state = StreamState::Closed;
                Ok(())
            }
            StreamState::Open => {
                self.state = StreamState::HalfClosed;
                Ok(())
            }
            StreamState::HalfClosed => {
                self.state = StreamState::Closed;
                Ok(())
            }
            StreamState::Closed => Err(TorError::Closed("stream already closed".into())),
        }
    }

    fn require(&self, expected: StreamState) -> Result<()> {
        if self.state != expected {
            return Err(TorError::protocol(format!(
                "stream {} expected state {:?}, was {:?}",
                self.stream_id, expected, self.state
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut s = Stream::new(1);
        s.on_begin_sent().unwrap();
        assert_eq!(s.state, StreamState::Connecting);
        s.on_connected().unwrap();
        assert_eq!(s.state, StreamState::Open);
        s.on_end().unwrap();
        assert_eq!(s.state, StreamState::HalfClosed);
        s.on_end().unwrap();
        assert_eq!(s.state, StreamState::Closed);
    }

    #[test]
    fn end_during_connecting_closes_directly() {
        let mut s = Stream::new(1);
        s.on_begin_sent().unwrap();
        s.on_end().unwrap();
        assert_eq!(s.state, StreamState::Closed);
    }

    #[test]
    fn deliver_window_emits_sendme_after_fifty_cells() {
        let mut s = Stream::new(1);
        s.on_begin_sent().unwrap();
        s.on_connected().unwrap();
        let mut sendme_count = 0;
        for _ in 0..50 {
            if s.on_data().unwrap() {
                sendme_count += 1;
            }
        }
        assert_eq!(sendme_count, 1);
        assert_eq!(s.window.deliver, STREAM_DELIVER_WINDOW);
    }

    #[test]
    fn window_never_goes_negative() {
        let mut w = FlowWindow::stream_default();
        for _ in 0..STREAM_PACKAGE_WINDOW {
            w.debit_package().unwrap();
        }
        assert!(w.debit_package().is_err());
    }
}
