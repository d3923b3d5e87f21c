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

// src/mem.rs
// In-memory collaborator implementations: a wildcard-matching subscription
// store with retained messages, a session store, and a line-oriented
// protocol driver. The example binary runs on these, and so do the
// integration tests; a production deployment swaps in its real codec and
// stores through the same traits.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::auth::{AclAccess, AclRequest};
use crate::client::{Client, ConnectMeta, DisconnectReason, QoS};
use crate::session::Session;
use crate::traits::{ClientIo, IoOutcome, SessionStore, SubscriptionStore};
use crate::worker::{WorkerContext, WorkerShared};

// MQTT filter matching: `+` matches one level, a trailing `#` matches the
// rest (including the parent level itself). Wildcard filters never match
// `$`-prefixed topics.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if (filter.starts_with('+') || filter.starts_with('#')) && topic.starts_with('$') {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(want), Some(have)) if want == have => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// The wire framing for an outbound delivery in the line protocol.
pub fn frame_message(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(topic.len() + payload.len() + 10);
    frame.extend_from_slice(b"message ");
    frame.extend_from_slice(topic.as_bytes());
    frame.push(b' ');
    frame.extend_from_slice(payload);
    frame.push(b'\n');
    frame
}

struct Subscriber {
    filter: String,
    worker: Arc<WorkerShared>,
    client: Weak<Client>,
}

struct Retained {
    payload: Vec<u8>,
}

// MemorySubscriptionStore routes published messages to matching
// subscribers. Delivery crosses worker boundaries the only allowed way:
// as a task posted onto the owning worker's queue. Subscribers whose
// client went away are pruned lazily on the next publish.
#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscribers: Mutex<Vec<Subscriber>>,
    retained: Mutex<HashMap<String, Retained>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: &str, worker: Arc<WorkerShared>, client: &Arc<Client>) {
        if let Some(session) = client.session() {
            session.add_subscription(filter);
        }
        // Replay matching retained messages to the new subscriber.
        {
            let retained = self.retained.lock();
            for (topic, message) in retained.iter() {
                if topic_matches(filter, topic) {
                    Self::deliver(&worker, client, topic, &message.payload);
                }
            }
        }
        self.subscribers.lock().push(Subscriber {
            filter: filter.to_string(),
            worker,
            client: Arc::downgrade(client),
        });
        debug!(filter, client_id = client.client_id(), "subscription added");
    }

    pub fn unsubscribe(&self, client: &Arc<Client>, filter: &str) {
        if let Some(session) = client.session() {
            session.remove_subscription(filter);
        }
        self.subscribers.lock().retain(|sub| {
            !(sub.filter == filter
                && sub
                    .client
                    .upgrade()
                    .is_some_and(|c| Arc::ptr_eq(&c, client)))
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn deliver(worker: &Arc<WorkerShared>, client: &Arc<Client>, topic: &str, payload: &[u8]) {
        let token = client.handle();
        let frame = frame_message(topic, payload);
        worker.post(Box::new(move |core| core.deliver_to(token, &frame)));
    }
}

impl SubscriptionStore for MemorySubscriptionStore {
    fn publish(
        &self,
        topic: &str,
        _qos: QoS,
        retain: bool,
        payload: &[u8],
        _user_properties: &[(String, String)],
    ) {
        if retain {
            let mut retained = self.retained.lock();
            if payload.is_empty() {
                retained.remove(topic);
            } else {
                retained.insert(
                    topic.to_string(),
                    Retained {
                        payload: payload.to_vec(),
                    },
                );
            }
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| sub.client.strong_count() > 0);
        for sub in subscribers.iter() {
            if !topic_matches(&sub.filter, topic) {
                continue;
            }
            if let Some(client) = sub.client.upgrade() {
                Self::deliver(&sub.worker, &client, topic, payload);
            }
        }
    }
}

// MemorySessionStore keeps sessions by client id. Clean-start connects
// replace whatever was stored; resumed sessions stop aging while a client
// is attached.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Arc<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl SessionStore for MemorySessionStore {
    fn attach(&self, meta: &ConnectMeta) -> Arc<Session> {
        if meta.clean_start {
            let session = Arc::new(Session::new(
                meta.client_id.clone(),
                true,
                meta.session_expiry,
            ));
            self.sessions
                .insert(meta.client_id.clone(), Arc::clone(&session));
            return session;
        }
        self.sessions
            .entry(meta.client_id.clone())
            .or_insert_with(|| {
                Arc::new(Session::new(
                    meta.client_id.clone(),
                    false,
                    meta.session_expiry,
                ))
            })
            .clone()
    }

    fn release(&self, session: &Arc<Session>, now: Instant) {
        session.mark_detached(now);
        if session.is_expired(now) {
            self.sessions
                .remove_if(session.client_id(), |_, stored| Arc::ptr_eq(stored, session));
        }
    }

    fn reap_expired(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        before - self.sessions.len()
    }
}

const READ_CHUNK: usize = 4096;

// LineProtoIo is a deliberately small text protocol speaking the core's
// contracts end to end:
//
//   pub <topic> <payload>     publish
//   pubret <topic> <payload>  publish retained
//   sub <filter>              subscribe
//   unsub <filter>            unsubscribe
//   ping                      liveness probe, answered with "pong"
//   disconnect                clean disconnect (discards the will)
//
// Deliveries arrive as "message <topic> <payload>" lines; the shutdown
// DISCONNECT frame is a "disconnect <reason>" line.
pub struct LineProtoIo {
    store: Arc<MemorySubscriptionStore>,
}

impl LineProtoIo {
    pub fn new(store: Arc<MemorySubscriptionStore>) -> Self {
        Self { store }
    }

    fn handle_line(
        &self,
        ctx: &WorkerContext<'_>,
        client: &Arc<Client>,
        line: &str,
    ) -> Option<IoOutcome> {
        let username = client.username().unwrap_or_default();
        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(verb @ ("pub" | "pubret")), Some(topic), payload) => {
                let payload = payload.unwrap_or("").as_bytes();
                ctx.counters().messages_received.inc();
                let retain = verb == "pubret";
                let request = AclRequest {
                    topic,
                    qos: QoS::AtMostOnce,
                    retain,
                    payload,
                };
                let verdict = ctx.auth.acl_check(
                    AclAccess::Write,
                    client.client_id(),
                    &username,
                    &request,
                );
                if verdict.is_success() {
                    ctx.router.publish(topic, QoS::AtMostOnce, retain, payload, &[]);
                } else {
                    info!(
                        client_id = client.client_id(),
                        topic, ?verdict, "publish denied"
                    );
                    client
                        .write_buffer()
                        .push(format!("denied pub {topic}\n").as_bytes());
                }
                None
            }
            (Some("sub"), Some(filter), None) => {
                let request = AclRequest {
                    topic: filter,
                    qos: QoS::AtMostOnce,
                    retain: false,
                    payload: &[],
                };
                let verdict = ctx.auth.acl_check(
                    AclAccess::Subscribe,
                    client.client_id(),
                    &username,
                    &request,
                );
                if verdict.is_success() {
                    self.store
                        .subscribe(filter, Arc::clone(ctx.shared), client);
                } else {
                    info!(
                        client_id = client.client_id(),
                        filter, ?verdict, "subscribe denied"
                    );
                    client
                        .write_buffer()
                        .push(format!("denied sub {filter}\n").as_bytes());
                }
                None
            }
            (Some("unsub"), Some(filter), None) => {
                self.store.unsubscribe(client, filter);
                None
            }
            (Some("ping"), None, None) => {
                client.write_buffer().push(b"pong\n");
                None
            }
            (Some("disconnect"), None, None) => {
                client.clear_will();
                Some(IoOutcome::Disconnect(DisconnectReason::NormalDisconnect))
            }
            _ => Some(IoOutcome::Disconnect(DisconnectReason::ProtocolError)),
        }
    }
}

impl ClientIo for LineProtoIo {
    fn on_readable(&self, ctx: &WorkerContext<'_>, client: &Arc<Client>) -> IoOutcome {
        // Readiness is edge-triggered: always drain the socket to
        // WouldBlock, parsing as we go so the read buffer stays level.
        let mut chunk = [0u8; READ_CHUNK];
        let mut saw_eof = false;
        loop {
            let read = {
                let mut stream = client.stream();
                stream.read(&mut chunk)
            };
            match read {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => {
                    client.read_buffer().push(&chunk[..n]);
                    client.touch();
                    loop {
                        let line = client.read_buffer().take_line();
                        let Some(line) = line else { break };
                        if line.is_empty() {
                            continue;
                        }
                        if let Some(outcome) = self.handle_line(ctx, client, &line) {
                            return outcome;
                        }
                    }
                    // Still over the watermark with no complete line in
                    // sight: one oversized line, which this protocol does
                    // not allow.
                    if client.read_buffer().over_watermark() {
                        return IoOutcome::Disconnect(DisconnectReason::ProtocolError);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return IoOutcome::Disconnect(DisconnectReason::ConnectionLost),
            }
        }

        if saw_eof {
            return IoOutcome::Disconnect(DisconnectReason::ConnectionLost);
        }
        if client.write_buffer().is_empty() {
            IoOutcome::Idle
        } else {
            IoOutcome::NeedsWrite
        }
    }

    fn on_writable(&self, _ctx: &WorkerContext<'_>, client: &Arc<Client>) -> IoOutcome {
        let mut buffer = client.write_buffer();
        while !buffer.is_empty() {
            let written = {
                let mut stream = client.stream();
                stream.write(buffer.as_slice())
            };
            match written {
                Ok(0) => return IoOutcome::Disconnect(DisconnectReason::ConnectionLost),
                Ok(n) => {
                    let _ = buffer.take(n);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return IoOutcome::Disconnect(DisconnectReason::ConnectionLost),
            }
        }
        IoOutcome::Idle
    }

    fn send_disconnect(&self, client: &Client, reason: DisconnectReason) {
        // Best effort: flush what is pending, then the disconnect line.
        let mut buffer = client.write_buffer();
        let mut stream = client.stream();
        if !buffer.is_empty() {
            let pending = buffer.len();
            if stream.write_all(buffer.as_slice()).is_ok() {
                let _ = buffer.take(pending);
            }
        }
        let _ = stream.write_all(format!("disconnect {reason}\n").as_bytes());
        let _ = stream.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_filters() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("a/+", "a/b"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("+", "a/b"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/#", "b/a"));
    }

    #[test]
    fn wildcards_skip_dollar_topics() {
        assert!(!topic_matches("#", "$SYS/broker/clients/connected"));
        assert!(!topic_matches("+/broker", "$SYS/broker"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/clients/connected"));
    }

    #[test]
    fn session_store_lifecycle() {
        let store = MemorySessionStore::new();
        let meta = ConnectMeta {
            clean_start: false,
            session_expiry: Some(std::time::Duration::from_secs(60)),
            ..ConnectMeta::new("persist")
        };

        let first = store.attach(&meta);
        first.add_subscription("a/+");
        let resumed = store.attach(&meta);
        assert!(Arc::ptr_eq(&first, &resumed));
        assert_eq!(resumed.subscriptions(), vec!["a/+".to_string()]);

        // Clean start replaces the stored session.
        let clean = store.attach(&ConnectMeta {
            clean_start: true,
            ..ConnectMeta::new("persist")
        });
        assert!(!Arc::ptr_eq(&first, &clean));
        assert!(clean.subscriptions().is_empty());
    }

    #[test]
    fn session_store_reaps_expired() {
        let store = MemorySessionStore::new();
        let now = Instant::now();
        let meta = ConnectMeta {
            clean_start: false,
            session_expiry: Some(std::time::Duration::from_secs(10)),
            ..ConnectMeta::new("reap-me")
        };
        let session = store.attach(&meta);
        store.release(&session, now);
        assert_eq!(store.session_count(), 1);

        assert_eq!(store.reap_expired(now + std::time::Duration::from_secs(5)), 0);
        assert_eq!(
            store.reap_expired(now + std::time::Duration::from_secs(11)),
            1
        );
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn clean_sessions_leave_no_residue() {
        let store = MemorySessionStore::new();
        let session = store.attach(&ConnectMeta::new("ephemeral"));
        store.release(&session, Instant::now());
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn message_framing() {
        assert_eq!(frame_message("a/b", b"hi"), b"message a/b hi\n".to_vec());
    }
}
