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

// src/stats.rs
// $SYS statistics publication. Every stats_interval one worker acts as the
// lead for the tick (leadership rotates with the tick counter), sums the
// peer counters with plain atomic loads, and publishes the totals plus
// derived per-second rates as retained broker-topic messages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::client::QoS;
use crate::traits::SubscriptionStore;
use crate::worker::WorkerShared;

const SYS_MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
const SYS_MESSAGES_SENT: &str = "$SYS/broker/messages/sent";
const SYS_CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
const SYS_CONNECTS_TOTAL: &str = "$SYS/broker/connects/total";
const SYS_LOAD_RECEIVED: &str = "$SYS/broker/load/messages/received/persecond";
const SYS_LOAD_SENT: &str = "$SYS/broker/load/messages/sent/persecond";

// One aggregated view of the fleet, summed across workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub clients_connected: usize,
}

// Sum the per-worker counters. Counters are monotonic and written only by
// their owner; relaxed atomic loads are all the synchronization this
// needs.
pub fn aggregate(workers: &[Arc<WorkerShared>]) -> StatsSnapshot {
    let mut snapshot = StatsSnapshot::default();
    for worker in workers {
        let counters = worker.counters();
        snapshot.messages_received += counters.messages_received.get();
        snapshot.messages_sent += counters.messages_sent.get();
        snapshot.connects += counters.connects.get();
        snapshot.disconnects += counters.disconnects.get();
        snapshot.clients_connected += worker.client_count();
    }
    snapshot
}

// Per-worker pacing for the $SYS tick. Every worker keeps one of these;
// only the tick's lead publishes.
pub struct StatsPublisher {
    interval: Duration,
    next_due: Instant,
    tick: u64,
    last_snapshot: StatsSnapshot,
    last_sample_at: Instant,
}

impl StatsPublisher {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_due: now + interval,
            tick: 0,
            last_snapshot: StatsSnapshot::default(),
            last_sample_at: now,
        }
    }

    // A reload changed the interval; the next tick moves accordingly.
    pub fn set_interval(&mut self, interval: Duration, now: Instant) {
        if interval != self.interval {
            self.interval = interval;
            self.next_due = now + interval;
        }
    }

    pub fn next_due_in(&self, now: Instant) -> Duration {
        self.next_due.saturating_duration_since(now)
    }

    // Advance the tick if it is due. Returns true when this worker was the
    // lead and published.
    pub fn on_tick(
        &mut self,
        now: Instant,
        worker_id: usize,
        workers: &[Arc<WorkerShared>],
        router: &dyn SubscriptionStore,
    ) -> bool {
        if now < self.next_due || workers.is_empty() {
            return false;
        }
        let tick = self.tick;
        self.tick += 1;
        while self.next_due <= now {
            self.next_due += self.interval;
        }

        if tick % workers.len() as u64 != worker_id as u64 {
            return false;
        }

        let snapshot = aggregate(workers);
        let elapsed = now.saturating_duration_since(self.last_sample_at);
        let received_rate = per_second(
            snapshot
                .messages_received
                .saturating_sub(self.last_snapshot.messages_received),
            elapsed,
        );
        let sent_rate = per_second(
            snapshot
                .messages_sent
                .saturating_sub(self.last_snapshot.messages_sent),
            elapsed,
        );
        self.last_snapshot = snapshot;
        self.last_sample_at = now;

        publish_number(router, SYS_MESSAGES_RECEIVED, snapshot.messages_received);
        publish_number(router, SYS_MESSAGES_SENT, snapshot.messages_sent);
        publish_number(router, SYS_CLIENTS_CONNECTED, snapshot.clients_connected as u64);
        publish_number(router, SYS_CONNECTS_TOTAL, snapshot.connects);
        publish_number(router, SYS_LOAD_RECEIVED, received_rate);
        publish_number(router, SYS_LOAD_SENT, sent_rate);

        debug!(
            worker = worker_id,
            clients = snapshot.clients_connected,
            received = snapshot.messages_received,
            sent = snapshot.messages_sent,
            "$SYS statistics published"
        );
        true
    }
}

fn per_second(delta: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (delta as f64 / secs).round() as u64
}

fn publish_number(router: &dyn SubscriptionStore, topic: &str, value: u64) {
    router.publish(
        topic,
        QoS::AtMostOnce,
        true,
        value.to_string().as_bytes(),
        &[],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingRouter, worker_shared};

    #[test]
    fn aggregation_sums_across_workers() {
        let (a, _mux_a) = worker_shared(0);
        let (b, _mux_b) = worker_shared(1);
        a.counters().messages_received.add(10);
        a.counters().connects.add(2);
        b.counters().messages_received.add(5);
        b.counters().messages_sent.add(7);

        let snapshot = aggregate(&[a, b]);
        assert_eq!(snapshot.messages_received, 15);
        assert_eq!(snapshot.messages_sent, 7);
        assert_eq!(snapshot.connects, 2);
        assert_eq!(snapshot.clients_connected, 0);
    }

    #[test]
    fn lead_rotates_with_the_tick() {
        let (a, _mux_a) = worker_shared(0);
        let (b, _mux_b) = worker_shared(1);
        let workers = vec![a, b];
        let router = RecordingRouter::default();
        let start = Instant::now();
        let interval = Duration::from_secs(10);

        let mut publisher_a = StatsPublisher::new(interval, start);
        let mut publisher_b = StatsPublisher::new(interval, start);

        // Tick 0: worker 0 leads.
        let t1 = start + Duration::from_secs(11);
        assert!(publisher_a.on_tick(t1, 0, &workers, &router));
        assert!(!publisher_b.on_tick(t1, 1, &workers, &router));

        // Tick 1: worker 1 leads.
        let t2 = start + Duration::from_secs(21);
        assert!(!publisher_a.on_tick(t2, 0, &workers, &router));
        assert!(publisher_b.on_tick(t2, 1, &workers, &router));
    }

    #[test]
    fn publishes_retained_totals_and_rates() {
        let (worker, _mux) = worker_shared(0);
        worker.counters().messages_received.add(100);
        let workers = vec![worker];
        let router = RecordingRouter::default();
        let start = Instant::now();

        let mut publisher = StatsPublisher::new(Duration::from_secs(10), start);
        assert!(publisher.on_tick(start + Duration::from_secs(10), 0, &workers, &router));

        let published = router.published();
        let received = published
            .iter()
            .find(|p| p.topic == SYS_MESSAGES_RECEIVED)
            .unwrap();
        assert_eq!(received.payload, b"100");
        assert!(received.retain);

        let rate = published
            .iter()
            .find(|p| p.topic == SYS_LOAD_RECEIVED)
            .unwrap();
        assert_eq!(rate.payload, b"10");
    }

    #[test]
    fn nothing_happens_before_the_interval() {
        let (worker, _mux) = worker_shared(0);
        let workers = vec![worker];
        let router = RecordingRouter::default();
        let start = Instant::now();

        let mut publisher = StatsPublisher::new(Duration::from_secs(10), start);
        assert!(!publisher.on_tick(start + Duration::from_secs(9), 0, &workers, &router));
        assert!(router.published().is_empty());
    }
}
