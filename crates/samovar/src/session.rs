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

// src/session.rs
// Session: the persistable state keyed by client id. It outlives any single
// Client (for clean-session=false / session-expiry > 0 peers) and is owned
// by an external SessionStore; the core only drives expiration and
// takeover. A session is never attached to two live Clients at once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::client::QoS;

// QueuedPublish is a QoS>0 message parked for a disconnected session.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug)]
pub struct Session {
    client_id: String,
    clean_start: bool,
    expiry_interval: Option<Duration>,
    subscriptions: Mutex<Vec<String>>,
    queued: Mutex<VecDeque<QueuedPublish>>,
    // Rolling packet-id source, mapped into 1..=65535 on use.
    packet_id_counter: AtomicU16,
    // Set while the session is orphaned; None while a client is attached.
    expires_at: Mutex<Option<Instant>>,
}

impl Session {
    pub fn new(
        client_id: impl Into<String>,
        clean_start: bool,
        expiry_interval: Option<Duration>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            clean_start,
            expiry_interval,
            subscriptions: Mutex::new(Vec::new()),
            queued: Mutex::new(VecDeque::new()),
            packet_id_counter: AtomicU16::new(0),
            expires_at: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn clean_start(&self) -> bool {
        self.clean_start
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn add_subscription(&self, filter: impl Into<String>) {
        let filter = filter.into();
        let mut subs = self.subscriptions.lock();
        if !subs.contains(&filter) {
            subs.push(filter);
        }
    }

    pub fn remove_subscription(&self, filter: &str) {
        self.subscriptions.lock().retain(|s| s != filter);
    }

    pub fn queue_message(&self, publish: QueuedPublish) {
        self.queued.lock().push_back(publish);
    }

    pub fn drain_queued(&self) -> Vec<QueuedPublish> {
        self.queued.lock().drain(..).collect()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.lock().len()
    }

    // Next MQTT packet identifier; zero is not a legal id, so the counter
    // maps onto 1..=65535 and wraps.
    pub fn next_packet_id(&self) -> u16 {
        let n = self.packet_id_counter.fetch_add(1, Ordering::Relaxed);
        (n % 65535) + 1
    }

    // A client attached; the session stops aging.
    pub fn mark_attached(&self) {
        *self.expires_at.lock() = None;
    }

    // The client detached. Clean-start sessions and sessions without an
    // expiry interval die immediately; the rest get a deadline.
    pub fn mark_detached(&self, now: Instant) {
        let deadline = match (self.clean_start, self.expiry_interval) {
            (true, _) | (false, None) => now,
            (false, Some(interval)) => now + interval,
        };
        *self.expires_at.lock() = Some(deadline);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match *self.expires_at.lock() {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}
