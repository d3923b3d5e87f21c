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

// src/test_support.rs
// Shared fixtures for the unit tests: loopback socket pairs, standalone
// clients and workers, and a recording subscription store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mio::Token;
use parking_lot::Mutex;

use crate::client::{Client, ConnectMeta, QoS};
use crate::config::Settings;
use crate::counters::WorkerCounters;
use crate::traits::SubscriptionStore;
use crate::worker::{Multiplexer, WorkerShared};

// Tokens for clients built outside a worker, clear of anything a real
// loop would allocate.
static NEXT_TEST_TOKEN: AtomicUsize = AtomicUsize::new(1_000_000);

// A connected pair: the test side (blocking std stream) and the broker
// side (non-blocking mio stream).
pub(crate) fn loopback_pair() -> (std::net::TcpStream, mio::net::TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let test_side = std::net::TcpStream::connect(addr).unwrap();
    let (broker_side, _) = listener.accept().unwrap();
    broker_side.set_nonblocking(true).unwrap();
    (test_side, mio::net::TcpStream::from_std(broker_side))
}

pub(crate) fn loopback_client(meta: ConnectMeta) -> (Arc<Client>, std::net::TcpStream) {
    let (test_side, broker_side) = loopback_pair();
    let addr = broker_side.peer_addr().unwrap();
    let client = Arc::new(Client::new(
        Token(NEXT_TEST_TOKEN.fetch_add(1, Ordering::Relaxed)),
        broker_side,
        addr,
        meta,
        Arc::new(WorkerCounters::new()),
        &Settings::default(),
    ));
    (client, test_side)
}

pub(crate) fn worker_shared(id: usize) -> (Arc<WorkerShared>, Multiplexer) {
    let (mux, waker) = Multiplexer::new().unwrap();
    (WorkerShared::new(id, waker), mux)
}

#[derive(Clone, Debug)]
pub(crate) struct PublishedRecord {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
}

// Records every publish for assertions.
#[derive(Default)]
pub(crate) struct RecordingRouter {
    published: Mutex<Vec<PublishedRecord>>,
}

impl RecordingRouter {
    pub(crate) fn published(&self) -> Vec<PublishedRecord> {
        self.published.lock().clone()
    }
}

impl SubscriptionStore for RecordingRouter {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
        _user_properties: &[(String, String)],
    ) {
        self.published.lock().push(PublishedRecord {
            topic: topic.to_string(),
            qos,
            retain,
            payload: payload.to_vec(),
        });
    }
}
