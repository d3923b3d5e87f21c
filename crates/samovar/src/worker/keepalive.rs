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

// src/worker/keepalive.rs
// Bucketed keep-alive enforcement. Checks are keyed by absolute deadline
// truncated to whole seconds of the steady clock. Packet arrival never
// touches this map: the client's activity timestamp is read lazily when a
// bucket fires, and a still-alive client is re-enqueued at its residual
// deadline. One map mutation per client per keep-alive window instead of
// one per received byte.
//
// Each live client has at most one active check: the initial insert
// happens at registration, and from then on only a firing bucket may
// re-enqueue the check.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::client::{Client, steady_epoch};

// A scheduled probe for one client. `recheck` decides whether a re-armed
// check is enqueued after the bucket fires and the client turns out to be
// still alive.
pub(crate) struct KeepAliveCheck {
    client: Weak<Client>,
    recheck: bool,
}

pub struct KeepAliveScheduler {
    buckets: BTreeMap<u64, Vec<KeepAliveCheck>>,
}

impl KeepAliveScheduler {
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }

    // Arm the initial check for a newly registered client. Keep-alive 0
    // disables enforcement entirely; no entry is inserted.
    pub fn schedule(&mut self, client: &Arc<Client>, now: Instant) {
        let Some(grace) = client.keep_alive_grace() else {
            return;
        };
        self.insert(
            bucket_key_truncated(now + grace),
            KeepAliveCheck {
                client: Arc::downgrade(client),
                recheck: true,
            },
        );
    }

    fn insert(&mut self, key: u64, check: KeepAliveCheck) {
        self.buckets.entry(key).or_default().push(check);
    }

    // How long until the next bucket is due, if any check is pending.
    pub fn next_deadline_in(&self, now: Instant) -> Option<Duration> {
        let key = *self.buckets.keys().next()?;
        let deadline = steady_epoch() + Duration::from_secs(key);
        Some(deadline.saturating_duration_since(now))
    }

    pub fn pending_checks(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    // Fire every due bucket. Returns the clients that exceeded 1.5 times
    // their negotiated keep-alive; the caller disconnects them. Clients
    // that went away are discarded, live ones are re-enqueued at their
    // residual deadline (rounded up to the next whole-second bucket).
    pub fn fire_due(&mut self, now: Instant) -> Vec<Arc<Client>> {
        let now_key = bucket_key_truncated(now);
        let later = self.buckets.split_off(&(now_key + 1));
        let due = std::mem::replace(&mut self.buckets, later);

        let mut expired = Vec::new();
        for check in due.into_values().flatten() {
            let Some(client) = check.client.upgrade() else {
                continue;
            };
            if !client.is_connected() {
                continue;
            }
            let Some(grace) = client.keep_alive_grace() else {
                continue;
            };
            let idle = client.idle_for(now);
            if idle < grace {
                if check.recheck {
                    let residual = grace - idle;
                    self.insert(
                        bucket_key_rounded_up(now + residual),
                        KeepAliveCheck {
                            client: check.client,
                            recheck: true,
                        },
                    );
                }
            } else {
                expired.push(client);
            }
        }
        expired
    }
}

impl Default for KeepAliveScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_key_truncated(deadline: Instant) -> u64 {
    deadline
        .saturating_duration_since(steady_epoch())
        .as_secs()
}

fn bucket_key_rounded_up(deadline: Instant) -> u64 {
    let since = deadline.saturating_duration_since(steady_epoch());
    let mut key = since.as_secs();
    if since.subsec_nanos() > 0 {
        key += 1;
    }
    key
}
