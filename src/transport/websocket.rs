//! WebSocket transport: the client's only way to reach a bridge from
//! inside a browser sandbox (no raw TCP sockets are available to WASM).
//!
//! This type implements `Duplex` so the link layer can run over it the
//! same way it would over any other stream; reconnection with backoff
//! lives here because a dropped WebSocket is the common failure mode for
//! a browser tab moving across networks or waking from sleep.
//!
//! Data flow: client WASM <-> WebSocket <-> bridge <-> Tor relay.

use futures::io::{AsyncRead, AsyncWrite};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::io::{self, Result as IoResult};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{BinaryType, ErrorEvent, MessageEvent, WebSocket};

/// Connection state for the underlying WebSocket.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Inner state shared between callbacks and async methods.
/// UnsafeCell is safe because WASM is single-threaded.
struct StreamState {
    state: ConnectionState,
    recv_buffer: VecDeque<u8>,
    send_buffer: VecDeque<u8>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    error: Option<String>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            recv_buffer: VecDeque::new(),
            send_buffer: VecDeque::new(),
            read_waker: None,
            write_waker: None,
            error: None,
        }
    }
}

/// WebSocket-backed duplex stream to a bridge.
pub struct WasmTcpStream {
    ws: WebSocket,
    state: Rc<UnsafeCell<StreamState>>,
}

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BACKOFF_MS: [u32; 5] = [1_000, 2_000, 4_000, 8_000, 16_000];

impl WasmTcpStream {
    /// Connects to a bridge, retrying with exponential backoff
    /// (1s, 2s, 4s, 8s, 16s) if the initial handshake fails.
    pub async fn connect_with_retry(url: &str) -> IoResult<Self> {
        let mut last_err = None;
        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            match Self::connect(url).await {
                Ok(stream) => {
                    if attempt > 0 {
                        log::info!("websocket reconnected on attempt {}", attempt + 1);
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    log::warn!("websocket connect attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e);

                    if attempt + 1 < MAX_RECONNECT_ATTEMPTS {
                        let delay = RECONNECT_BACKOFF_MS[attempt as usize];
                        gloo_timers::future::TimeoutFuture::new(delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::TimedOut, "all reconnection attempts failed")
        }))
    }

    /// Connects to a bridge once, without retry.
    pub async fn connect(url: &str) -> IoResult<Self> {
        log::info!("connecting to bridge websocket: {}", url);

        let ws = WebSocket::new(url).map_err(|e| {
            log::error!("failed to create websocket: {:?}", e);
            io::Error::new(io::ErrorKind::ConnectionRefused, "failed to create websocket")
        })?;
        ws.set_binary_type(BinaryType::Arraybuffer);

        let state = Rc::new(UnsafeCell::new(StreamState::new()));
        Self::setup_handlers(&ws, state.clone())?;

        let state_clone = state.clone();
        futures::future::poll_fn(move |cx| {
            let st = unsafe { &mut *state_clone.get() };
            if let Some(err) = &st.error {
                return Poll::Ready(Err(io::Error::other(err.clone())));
            }
            match st.state {
                ConnectionState::Connected => Poll::Ready(Ok(())),
                ConnectionState::Closed | ConnectionState::Closing => Poll::Ready(Err(
                    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed before established"),
                )),
                ConnectionState::Connecting => {
                    st.read_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await?;

        log::info!("websocket connected");
        Ok(Self { ws, state })
    }

    fn setup_handlers(ws: &WebSocket, state: Rc<UnsafeCell<StreamState>>) -> IoResult<()> {
        {
            let state_clone = state.clone();
            let onopen = Closure::wrap(Box::new(move |_event: JsValue| {
                let st = unsafe { &mut *state_clone.get() };
                st.state = ConnectionState::Connected;
                if let Some(waker) = st.read_waker.take() {
                    waker.wake();
                }
            }) as Box<dyn FnMut(JsValue)>);
            ws.set_onopen(Some(onopen.as_ref().unchecked_ref()));
            onopen.forget();
        }

        {
            let state_clone = state.clone();
            let onmessage = Closure::wrap(Box::new(move |event: MessageEvent| {
                if let Ok(array_buffer) = event.data().dyn_into::<js_sys::ArrayBuffer>() {
                    let data = js_sys::Uint8Array::new(&array_buffer).to_vec();
                    let st = unsafe { &mut *state_clone.get() };
                    st.recv_buffer.extend(data);
                    if let Some(waker) = st.read_waker.take() {
                        waker.wake();
                    }
                }
            }) as Box<dyn FnMut(MessageEvent)>);
            ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
            onmessage.forget();
        }

        {
            let state_clone = state.clone();
            let onerror = Closure::wrap(Box::new(move |event: ErrorEvent| {
                let st = unsafe { &mut *state_clone.get() };
                st.error = Some(format!("websocket error: {}", event.message()));
                st.state = ConnectionState::Closed;
                if let Some(waker) = st.read_waker.take() {
                    waker.wake();
                }
                if let Some(waker) = st.write_waker.take() {
                    waker.wake();
                }
            }) as Box<dyn FnMut(ErrorEvent)>);
            ws.set_onerror(Some(onerror.as_ref().unchecked_ref()));
            onerror.forget();
        }

        {
            let state_clone = state.clone();
            let onclose = Closure::wrap(Box::new(move |_event: JsValue| {
                let st = unsafe { &mut *state_clone.get() };
                st.state = ConnectionState::Closed;
                if let Some(waker) = st.read_waker.take() {
                    waker.wake();
                }
                if let Some(waker) = st.write_waker.take() {
                    waker.wake();
                }
            }) as Box<dyn FnMut(JsValue)>);
            ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));
            onclose.forget();
        }

        Ok(())
    }

    /// Flushes the send buffer to the socket as a single binary frame.
    fn flush_send_buffer(&self) -> IoResult<()> {
        let state = unsafe { &mut *self.state.get() };

        if state.send_buffer.is_empty() {
            return Ok(());
        }

        match state.state {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "connection not yet established"));
            }
            _ => {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
            }
        }

        let data: Vec<u8> = state.send_buffer.drain(..).collect();
        if data.is_empty() {
            return Ok(());
        }

        let array = js_sys::Uint8Array::from(&data[..]);
        self.ws.send_with_array_buffer(&array.buffer()).map_err(|e| {
            log::error!("failed to send over websocket: {:?}", e);
            io::Error::other("failed to send data over websocket")
        })
    }
}

impl AsyncRead for WasmTcpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<IoResult<usize>> {
        let state = unsafe { &mut *self.state.get() };

        if let Some(err) = &state.error {
            return Poll::Ready(Err(io::Error::other(err.clone())));
        }

        if state.state == ConnectionState::Closed && state.recv_buffer.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if !state.recv_buffer.is_empty() {
            let to_read = buf.len().min(state.recv_buffer.len());
            for (i, byte) in state.recv_buffer.drain(..to_read).enumerate() {
                buf[i] = byte;
            }
            return Poll::Ready(Ok(to_read));
        }

        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for WasmTcpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<IoResult<usize>> {
        let state = unsafe { &mut *self.state.get() };

        if let Some(err) = &state.error {
            return Poll::Ready(Err(io::Error::other(err.clone())));
        }

        match state.state {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => {
                state.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            _ => {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")));
            }
        }

        state.send_buffer.extend(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        match self.flush_send_buffer() {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                let state = unsafe { &mut *self.state.get() };
                state.write_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        if let Err(e) = self.flush_send_buffer() {
            return Poll::Ready(Err(e));
        }

        let state = unsafe { &mut *self.state.get() };
        if state.state != ConnectionState::Closed {
            state.state = ConnectionState::Closing;
            let _ = self.ws.close();
        }

        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for WasmTcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = unsafe { &*self.state.get() };
        f.debug_struct("WasmTcpStream")
            .field("state", &state.state)
            .field("recv_buffer_len", &state.recv_buffer.len())
            .field("send_buffer_len", &state.send_buffer.len())
            .finish()
    }
}
