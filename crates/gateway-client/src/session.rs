//! One gateway call over one socket.
//!
//! The call is split in two halves:
//!
//! - [`CallMachine`] is a synchronous state machine. It is fed socket events
//!   (frames, close, errors, timers) and answers with [`Step`]s: frames to
//!   send and, exactly once, the call's outcome.
//! - [`run`] is the async driver. It owns the WebSocket, the connect settle
//!   delay and the deadline, and forwards events to the machine.
//!
//! ```text
//! Opening -> Connecting -> Authenticating -> (Challenged ->)? MethodSent -> Settled
//! ```
//!
//! The machine enforces the ordering rules: at most one connect request is in
//! flight, a second one is only sent when a challenge brings a new nonce, and
//! the method request is only sent after the connect response was accepted.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::{EventFrame, Frame, GatewayError, RequestFrame, ResponseFrame, Result};
use serde_json::Value;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::CloseFrame, Error as WsError, Message as WsMessage},
};
use url::Url;

use crate::handshake::Handshake;

/// Default call deadline.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Largest accepted call deadline.
pub const MAX_TIMEOUT_MS: u64 = 2_147_483_647;

/// Delay between socket open and the first connect request, leaving the
/// gateway time to send a challenge first.
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_millis(750);

/// Close code reported when the socket ends without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Payload status that marks an intermediate acknowledgement.
const ACCEPTED_STATUS: &str = "accepted";

/// Per-call options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOptions {
    /// Call deadline in milliseconds; `None` uses [`DEFAULT_TIMEOUT_MS`].
    pub timeout_ms: Option<u64>,
    /// Keep waiting past an `accepted` response for the final one.
    pub expect_final: bool,
    /// Delay before the first connect request.
    pub connect_delay: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            expect_final: false,
            connect_delay: DEFAULT_CONNECT_DELAY,
        }
    }
}

impl CallOptions {
    /// Creates options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the call deadline.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets whether to wait past an `accepted` response.
    pub fn with_expect_final(mut self, expect_final: bool) -> Self {
        self.expect_final = expect_final;
        self
    }

    /// Sets the delay before the first connect request.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// The deadline actually used, clamped to `1..=MAX_TIMEOUT_MS`.
    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout_ms
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .clamp(1, MAX_TIMEOUT_MS)
    }
}

/// Where a call currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Socket not open yet.
    Opening,
    /// Socket open, waiting for the settle delay or a challenge.
    Connecting,
    /// Unchallenged (`v1`) connect in flight.
    Authenticating { connect_id: String },
    /// Challenged (`v2`) connect in flight.
    Challenged { connect_id: String, nonce: String },
    /// Authenticated; method request in flight.
    MethodSent { method_id: String },
    /// Outcome delivered.
    Settled,
}

/// What the driver must do next.
#[derive(Debug)]
pub enum Step {
    /// Write this request to the socket.
    Send(RequestFrame),
    /// Deliver the outcome and close the socket.
    Settle(Result<Value>),
}

/// State machine for a single call.
pub struct CallMachine {
    handshake: Handshake,
    method: String,
    params: Value,
    expect_final: bool,
    timeout_ms: u64,
    state: CallState,
}

impl CallMachine {
    /// Creates a machine for calling `method` with `params`.
    pub fn new(handshake: Handshake, method: impl Into<String>, params: Value, options: &CallOptions) -> Self {
        Self {
            handshake,
            method: method.into(),
            params,
            expect_final: options.expect_final,
            timeout_ms: options.effective_timeout_ms(),
            state: CallState::Opening,
        }
    }

    /// Current state.
    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// Whether the outcome was already delivered.
    pub fn is_settled(&self) -> bool {
        self.state == CallState::Settled
    }

    /// The socket is open.
    pub fn start(&mut self) -> Vec<Step> {
        if self.state == CallState::Opening {
            self.state = CallState::Connecting;
        }
        Vec::new()
    }

    /// The settle delay passed without a challenge: send a `v1` connect.
    pub fn on_connect_delay_elapsed(&mut self) -> Vec<Step> {
        if self.state != CallState::Connecting {
            return Vec::new();
        }
        self.send_connect(None)
    }

    /// A frame arrived.
    pub fn on_frame(&mut self, frame: Frame) -> Vec<Step> {
        match frame {
            Frame::Event(event) => self.on_event(event),
            Frame::Response(response) => self.on_response(response),
            Frame::Request(request) => {
                tracing::debug!(method = %request.method, "ignoring request frame from gateway");
                Vec::new()
            }
        }
    }

    /// The socket closed, with the peer's close code and reason if it sent any.
    pub fn on_closed(&mut self, code: Option<u16>, reason: &str) -> Vec<Step> {
        self.fail(GatewayError::ConnectionClosed {
            code: code.unwrap_or(ABNORMAL_CLOSE_CODE),
            reason: reason.to_string(),
        })
    }

    /// The socket failed.
    pub fn on_transport_error(&mut self, message: impl Into<String>) -> Vec<Step> {
        self.fail(GatewayError::Transport(message.into()))
    }

    /// The call deadline passed.
    pub fn on_deadline(&mut self) -> Vec<Step> {
        self.fail(GatewayError::Timeout {
            timeout_ms: self.timeout_ms,
        })
    }

    /// Settles with `error` unless already settled.
    pub fn fail(&mut self, error: GatewayError) -> Vec<Step> {
        self.settle(Err(error))
    }

    fn settle(&mut self, outcome: Result<Value>) -> Vec<Step> {
        if self.is_settled() {
            return Vec::new();
        }
        self.state = CallState::Settled;
        vec![Step::Settle(outcome)]
    }

    fn on_event(&mut self, event: EventFrame) -> Vec<Step> {
        let Some(nonce) = event.challenge_nonce() else {
            tracing::debug!(event = %event.event, "ignoring event");
            return Vec::new();
        };

        match &self.state {
            CallState::Connecting | CallState::Authenticating { .. } => {
                tracing::debug!("received connect challenge");
                let nonce = nonce.to_string();
                self.send_connect(Some(nonce))
            }
            CallState::Challenged { nonce: current, .. } if current != nonce => {
                tracing::debug!("received new connect challenge, re-signing");
                let nonce = nonce.to_string();
                self.send_connect(Some(nonce))
            }
            _ => {
                tracing::debug!(state = ?self.state, "ignoring connect challenge");
                Vec::new()
            }
        }
    }

    fn on_response(&mut self, response: ResponseFrame) -> Vec<Step> {
        match &self.state {
            CallState::Authenticating { connect_id } | CallState::Challenged { connect_id, .. }
                if *connect_id == response.id =>
            {
                match self.handshake.complete(&response) {
                    Ok(_) => self.send_method(),
                    Err(e) => self.fail(e),
                }
            }
            CallState::MethodSent { method_id } if *method_id == response.id => {
                if !response.ok {
                    let error = GatewayError::method(self.method.clone(), response.error_message());
                    return self.fail(error);
                }
                if self.expect_final && response.status() == Some(ACCEPTED_STATUS) {
                    tracing::debug!(method = %self.method, "call accepted, waiting for final response");
                    return Vec::new();
                }
                self.settle(Ok(response.payload.unwrap_or(Value::Null)))
            }
            _ => {
                tracing::debug!(id = %response.id, "ignoring response for unknown request");
                Vec::new()
            }
        }
    }

    fn send_connect(&mut self, nonce: Option<String>) -> Vec<Step> {
        let request = match self.handshake.connect_request(nonce.as_deref()) {
            Ok(request) => request,
            Err(e) => return self.fail(e),
        };
        let connect_id = request.id.clone();
        tracing::debug!(
            device_id = %self.handshake.device_id(),
            role = %self.handshake.role(),
            token_source = ?self.handshake.token_source(),
            signed = if nonce.is_some() { "v2" } else { "v1" },
            "sending connect"
        );
        self.state = match nonce {
            Some(nonce) => CallState::Challenged { connect_id, nonce },
            None => CallState::Authenticating { connect_id },
        };
        vec![Step::Send(request)]
    }

    fn send_method(&mut self) -> Vec<Step> {
        let request = RequestFrame::new(self.method.clone(), Some(self.params.clone()));
        tracing::debug!(method = %self.method, id = %request.id, "authenticated, sending method request");
        self.state = CallState::MethodSent {
            method_id: request.id.clone(),
        };
        vec![Step::Send(request)]
    }
}

fn transport_error(error: WsError) -> GatewayError {
    GatewayError::Transport(error.to_string())
}

fn close_details(frame: Option<CloseFrame<'_>>) -> (Option<u16>, String) {
    match frame {
        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
        None => (None, String::new()),
    }
}

/// Drives `machine` over a fresh WebSocket to `url` until it settles.
///
/// The deadline covers the whole call, socket open included. The socket is
/// closed exactly once, when the machine settles, unless the peer already
/// closed it.
pub async fn run(url: &Url, mut machine: CallMachine, options: &CallOptions) -> Result<Value> {
    let timeout_ms = options.effective_timeout_ms();
    let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
    tokio::pin!(deadline);

    tracing::debug!(url = %url, timeout_ms, "opening gateway socket");
    let ws_stream = tokio::select! {
        result = connect_async(url.as_str()) => result.map(|(stream, _)| stream).map_err(transport_error)?,
        _ = &mut deadline => return Err(GatewayError::Timeout { timeout_ms }),
    };
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let mut steps: VecDeque<Step> = machine.start().into();
    let connect_delay = tokio::time::sleep(options.connect_delay);
    tokio::pin!(connect_delay);
    let mut delay_elapsed = false;
    let mut socket_closed = false;

    loop {
        while let Some(step) = steps.pop_front() {
            match step {
                Step::Send(request) => {
                    let sent = match request.encode() {
                        Ok(text) => ws_sink.send(WsMessage::Text(text)).await.map_err(transport_error),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        tracing::warn!(error = %e, "failed to send request");
                        steps.extend(machine.fail(e));
                    }
                }
                Step::Settle(outcome) => {
                    if !socket_closed {
                        if let Err(e) = ws_sink.close().await {
                            tracing::debug!(error = %e, "error closing gateway socket");
                        }
                    }
                    return outcome;
                }
            }
        }

        let next = tokio::select! {
            _ = &mut deadline => machine.on_deadline(),
            _ = &mut connect_delay, if !delay_elapsed => {
                delay_elapsed = true;
                machine.on_connect_delay_elapsed()
            }
            message = ws_stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => match Frame::parse(&text) {
                    Some(frame) => machine.on_frame(frame),
                    None => {
                        tracing::debug!("dropping unparseable frame");
                        Vec::new()
                    }
                },
                Some(Ok(WsMessage::Binary(bytes))) => match Frame::parse_bytes(&bytes) {
                    Some(frame) => machine.on_frame(frame),
                    None => {
                        tracing::debug!("dropping unparseable binary frame");
                        Vec::new()
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    socket_closed = true;
                    let (code, reason) = close_details(frame);
                    machine.on_closed(code, &reason)
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => {
                    socket_closed = true;
                    machine.on_transport_error(e.to_string())
                }
                None => {
                    socket_closed = true;
                    machine.on_closed(None, "")
                }
            },
        };
        steps.extend(next);
    }
}
