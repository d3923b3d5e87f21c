/*
 * SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

// src/client.rs
// The Client data model: one connected peer, pinned to one worker for its
// whole connected lifetime. The registry holds the primary Arc; keep-alive
// checks and the removal queue hold Weak references resolved on use.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use mio::Token;
use mio::net::TcpStream;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use crate::config::Settings;
use crate::counters::WorkerCounters;
use crate::session::Session;

// All steady-clock timestamps in the core are measured against one process
// epoch so they can be stored in atomics.
static STEADY_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

pub(crate) fn steady_epoch() -> Instant {
    *STEADY_EPOCH
}

pub(crate) fn instant_to_micros(instant: Instant) -> u64 {
    instant
        .saturating_duration_since(steady_epoch())
        .as_micros() as u64
}

pub(crate) fn micros_to_instant(micros: u64) -> Instant {
    steady_epoch() + Duration::from_micros(micros)
}

// ProtocolVersion is the MQTT protocol level the peer negotiated at
// CONNECT time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    V3_1,
    V3_1_1,
    V5,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V3_1 => write!(f, "3.1"),
            Self::V3_1_1 => write!(f, "3.1.1"),
            Self::V5 => write!(f, "5.0"),
        }
    }
}

// QoS is the MQTT quality-of-service level of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// DisconnectReason records why a client left (or is about to leave).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    // The peer sent a clean DISCONNECT. Its will is discarded.
    NormalDisconnect,
    // 1.5 times the negotiated keep-alive passed without a packet.
    KeepAliveTimeout,
    // The peer violated the protocol.
    ProtocolError,
    // login_check denied the connection, or the plugin errored.
    AuthenticationFailed,
    // An ACL check denied an operation that requires disconnect.
    NotAuthorized,
    // A newer connection with the same client id took the session over.
    SessionTakenOver,
    // The broker is shutting down.
    ServerShutdown,
    // The peer did not drain its traffic and blew the write watermark.
    WriteBufferOverflow,
    // The transport died underneath us.
    ConnectionLost,
}

impl DisconnectReason {
    // A will is published for every ungraceful departure.
    pub fn publishes_will(self) -> bool {
        !matches!(self, Self::NormalDisconnect)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NormalDisconnect => "normal disconnect",
            Self::KeepAliveTimeout => "keep-alive timeout",
            Self::ProtocolError => "protocol error",
            Self::AuthenticationFailed => "authentication failed",
            Self::NotAuthorized => "not authorized",
            Self::SessionTakenOver => "session taken over",
            Self::ServerShutdown => "server shutdown",
            Self::WriteBufferOverflow => "write buffer overflow",
            Self::ConnectionLost => "connection lost",
        };
        write!(f, "{text}")
    }
}

// WillMessage is the message a client deposited at CONNECT time, published
// by the broker when the client disconnects ungracefully.
#[derive(Clone, Debug, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub user_properties: Vec<(String, String)>,
}

// ConnectMeta is what the handshake in front of the core negotiated for a
// new connection: identity, protocol level, keep-alive, session wishes and
// the optional will.
#[derive(Clone, Debug)]
pub struct ConnectMeta {
    pub client_id: String,
    pub protocol: ProtocolVersion,
    pub keep_alive_secs: u16,
    pub clean_start: bool,
    pub session_expiry: Option<Duration>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<WillMessage>,
}

impl ConnectMeta {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            protocol: ProtocolVersion::V3_1_1,
            keep_alive_secs: 0,
            clean_start: true,
            session_expiry: None,
            username: None,
            password: None,
            will: None,
        }
    }
}

// FlowBuffer is a byte buffer with a high watermark. The watermark is
// advisory for reads (backpressure: stop reading) and a disconnect
// threshold for writes (the peer is not draining).
#[derive(Debug)]
pub struct FlowBuffer {
    buf: BytesMut,
    high_watermark: usize,
}

impl FlowBuffer {
    pub fn new(high_watermark: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            high_watermark,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn over_watermark(&self) -> bool {
        self.buf.len() > self.high_watermark
    }

    // Take up to n bytes off the front.
    pub fn take(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    // Drain one complete line (delimiter included in the scan, excluded
    // from the result). Used by line-oriented ClientIo implementations.
    pub fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line = self.buf.split_to(pos + 1);
        let text = String::from_utf8_lossy(&line[..pos]);
        Some(text.trim_end_matches('\r').to_string())
    }
}

// Lifecycle of a client. Connected -> Disconnecting happens wherever a
// disconnect reason is decided; Disconnecting -> Disconnected happens
// exactly once, in the worker's teardown.
const STATE_CONNECTED: u8 = 0;
const STATE_DISCONNECTING: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

// Client is a single connected peer. Owned by exactly one worker's
// ClientRegistry; the socket, buffers and mutable metadata sit behind their
// own locks so the registry can be read by foreign threads for stats
// without touching client internals.
pub struct Client {
    token: Token,
    remote_addr: SocketAddr,
    protocol: ProtocolVersion,
    keep_alive_secs: u16,
    client_id: String,
    username: Mutex<Option<String>>,
    stream: Mutex<TcpStream>,
    read_buffer: Mutex<FlowBuffer>,
    write_buffer: Mutex<FlowBuffer>,
    will: Mutex<Option<WillMessage>>,
    session: Mutex<Option<Arc<Session>>>,
    last_activity_micros: AtomicU64,
    state: AtomicU8,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    counters: Arc<WorkerCounters>,
}

impl Client {
    pub(crate) fn new(
        token: Token,
        stream: TcpStream,
        remote_addr: SocketAddr,
        meta: ConnectMeta,
        counters: Arc<WorkerCounters>,
        settings: &Settings,
    ) -> Self {
        Self {
            token,
            remote_addr,
            protocol: meta.protocol,
            keep_alive_secs: meta.keep_alive_secs,
            client_id: meta.client_id,
            username: Mutex::new(meta.username),
            stream: Mutex::new(stream),
            read_buffer: Mutex::new(FlowBuffer::new(settings.read_buffer_high_watermark)),
            write_buffer: Mutex::new(FlowBuffer::new(settings.write_buffer_high_watermark)),
            will: Mutex::new(meta.will),
            session: Mutex::new(None),
            last_activity_micros: AtomicU64::new(instant_to_micros(Instant::now())),
            state: AtomicU8::new(STATE_CONNECTED),
            disconnect_reason: Mutex::new(None),
            counters,
        }
    }

    pub fn handle(&self) -> Token {
        self.token
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn username(&self) -> Option<String> {
        self.username.lock().clone()
    }

    // Extended auth may settle on a different username mid-handshake.
    pub fn set_username(&self, username: Option<String>) {
        *self.username.lock() = username;
    }

    pub fn keep_alive_secs(&self) -> u16 {
        self.keep_alive_secs
    }

    // The tolerated silence: 1.5 times the negotiated keep-alive. None
    // when keep-alive is disabled.
    pub fn keep_alive_grace(&self) -> Option<Duration> {
        if self.keep_alive_secs == 0 {
            return None;
        }
        Some(Duration::from_millis(u64::from(self.keep_alive_secs) * 1500))
    }

    pub fn stream(&self) -> MutexGuard<'_, TcpStream> {
        self.stream.lock()
    }

    pub fn read_buffer(&self) -> MutexGuard<'_, FlowBuffer> {
        self.read_buffer.lock()
    }

    pub fn write_buffer(&self) -> MutexGuard<'_, FlowBuffer> {
        self.write_buffer.lock()
    }

    // Record packet activity. The keep-alive scheduler observes this
    // lazily when its bucket fires; no map mutation happens here.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub(crate) fn touch_at(&self, now: Instant) {
        self.last_activity_micros
            .store(instant_to_micros(now), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        micros_to_instant(self.last_activity_micros.load(Ordering::Relaxed))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    // Take the pending will for publication. Taking, rather than reading,
    // is what makes will delivery exactly-once between the shutdown path
    // and the normal teardown path.
    pub fn take_will(&self) -> Option<WillMessage> {
        self.will.lock().take()
    }

    // A clean DISCONNECT from the peer discards the will.
    pub fn clear_will(&self) {
        *self.will.lock() = None;
    }

    pub fn has_will(&self) -> bool {
        self.will.lock().is_some()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    pub(crate) fn set_session(&self, session: Arc<Session>) {
        *self.session.lock() = Some(session);
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CONNECTED
    }

    // Move Connected -> Disconnecting and record the reason. Returns false
    // if someone already decided this client's fate; the first reason wins.
    pub(crate) fn begin_disconnect(&self, reason: DisconnectReason) -> bool {
        let moved = self
            .state
            .compare_exchange(
                STATE_CONNECTED,
                STATE_DISCONNECTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            *self.disconnect_reason.lock() = Some(reason);
        }
        moved
    }

    // Move to Disconnected. Returns true exactly once, which is what makes
    // teardown idempotent no matter how many removal entries point here.
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.state.swap(STATE_DISCONNECTED, Ordering::AcqRel) != STATE_DISCONNECTED
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.disconnect_reason.lock()
    }

    pub fn counters(&self) -> &WorkerCounters {
        &self.counters
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("token", &self.token.0)
            .field("client_id", &self.client_id)
            .field("remote_addr", &self.remote_addr)
            .field("protocol", &self.protocol)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .finish_non_exhaustive()
    }
}
