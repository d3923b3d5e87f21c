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

//! Collaborator contracts consumed by the worker core.
//!
//! The core deliberately does not parse MQTT packets, match topic filters
//! or persist sessions. Those concerns plug in through the traits here:
//!
//! - [`ClientIo`]: drives a client's socket when the event loop reports
//!   readiness, and owns the wire protocol.
//! - [`SubscriptionStore`]: routes a published message to its subscribers
//!   (delivery to peer workers happens via tasks inside the store).
//! - [`SessionStore`]: owns [`Session`](crate::session::Session) lifetimes;
//!   the core only drives expiration sweeps.
//!
//! Simple in-memory implementations for demos and tests live in
//! [`mem`](crate::mem).

use std::sync::Arc;
use std::time::Instant;

use crate::client::{Client, ConnectMeta, DisconnectReason, QoS, WillMessage};
use crate::session::Session;
use crate::worker::WorkerContext;

/// What a readiness callback decided about the client.
#[derive(Debug, PartialEq, Eq)]
pub enum IoOutcome {
    /// Nothing further to do; wait for the next readiness event.
    Idle,
    /// Outbound data was buffered; the worker should add write interest.
    NeedsWrite,
    /// The client must go, for the given reason.
    Disconnect(DisconnectReason),
}

/// Protocol driver for a single client, invoked on the owning worker
/// thread only. Implementations read from and write to the client's
/// stream and buffers; auth decisions go through the
/// [`WorkerContext`]'s plugin binding so every check runs with the
/// worker's per-thread plugin memory.
pub trait ClientIo: Send + Sync {
    /// The socket became readable. Consume what is available, update the
    /// client's activity timestamp, and report what should happen next.
    fn on_readable(&self, ctx: &WorkerContext<'_>, client: &Arc<Client>) -> IoOutcome;

    /// The socket became writable. Flush buffered outbound data.
    fn on_writable(&self, ctx: &WorkerContext<'_>, client: &Arc<Client>) -> IoOutcome;

    /// The will to publish for an ungracefully departing client, if any.
    /// The default takes it off the client, which keeps delivery
    /// exactly-once across the shutdown and teardown paths.
    fn pending_will(&self, client: &Client) -> Option<WillMessage> {
        client.take_will()
    }

    /// When the client last produced protocol activity.
    fn last_activity(&self, client: &Client) -> Instant {
        client.last_activity()
    }

    /// Write a protocol-level DISCONNECT frame. Called during graceful
    /// shutdown after every worker has queued its wills; best effort.
    fn send_disconnect(&self, client: &Client, reason: DisconnectReason);
}

/// Routing path for published messages, including `$SYS` statistics and
/// wills. Synchronous from the caller's point of view; cross-worker
/// delivery is the store's business.
pub trait SubscriptionStore: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
        user_properties: &[(String, String)],
    );
}

/// Owner of persistable session state. The core calls `attach` when a
/// client lands on a worker, `release` when it leaves, and
/// `reap_expired` on its periodic sweep.
pub trait SessionStore: Send + Sync {
    /// Resume or create the session for a connecting client.
    fn attach(&self, meta: &ConnectMeta) -> Arc<Session>;

    /// The client detached; start the session's expiry clock.
    fn release(&self, session: &Arc<Session>, now: Instant);

    /// Drop sessions whose expiry deadline has passed. Returns how many
    /// were reaped.
    fn reap_expired(&self, now: Instant) -> usize;
}

/// The bundle of collaborators a fleet is started with.
#[derive(Clone)]
pub struct Hooks {
    pub io: Arc<dyn ClientIo>,
    pub router: Arc<dyn SubscriptionStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub auth: Arc<dyn crate::auth::AuthBackend>,
}
