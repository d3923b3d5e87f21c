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

// src/worker/mod.rs
// The per-worker event loop and client lifecycle management. A ThreadCore
// owns its clients for their whole connected lifetime; everything other
// threads may touch lives in WorkerShared (task queue, removal queue,
// registry, counters, wakeup handle).
//
// Loop order per iteration: drain tasks, handle readiness (reads before
// writes), fire timers, process removals. Tasks run first so a freshly
// registered client is visible in the same iteration; reads come before
// timer bookkeeping to keep latency down under load.

pub(crate) mod event_loop;
mod keepalive;
mod registry;
mod removal;
mod tasks;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mio::Token;
use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::auth::{AclAccess, AclRequest, AuthPluginBinding};
use crate::client::{Client, DisconnectReason};
use crate::config::Settings;
use crate::counters::WorkerCounters;
use crate::errors::CoreError;
use crate::fleet::{ClientLocation, FleetState, PendingConnection};
use crate::stats::StatsPublisher;
use crate::traits::{ClientIo, Hooks, IoOutcome, SessionStore, SubscriptionStore};

pub(crate) use event_loop::{Multiplexer, ReadyEvent, WAKER_TOKEN};
pub use keepalive::KeepAliveScheduler;
pub use registry::ClientRegistry;
pub use removal::RemovalQueue;
pub use tasks::{Task, TaskQueue};

// The longest the loop blocks in one readiness wait; the next timer may
// shorten it further.
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);
// Short waits while walking the shutdown barriers, so peer progress is
// observed promptly.
const SHUTDOWN_POLL_WAIT: Duration = Duration::from_millis(10);

// The first token handed to a connection; Token(0) belongs to the wakeup
// handle.
const FIRST_CLIENT_TOKEN: usize = 1;

// What the worker thread itself is doing about shutdown. The fleet-wide
// view lives in the ShutdownCoordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownPhase {
    Running,
    WillsQueued,
    DisconnectsSent,
}

// WorkerShared is the cross-thread face of a worker: the task queue is
// the sole write channel in, the registry and counters are readable for
// statistics, and the waker unblocks the loop. Everything else about the
// worker stays private to its thread.
pub struct WorkerShared {
    id: usize,
    tasks: TaskQueue,
    removals: RemovalQueue,
    registry: Arc<ClientRegistry>,
    waker: Arc<mio::Waker>,
    counters: Arc<WorkerCounters>,
    unhealthy: AtomicBool,
    pending_settings: Mutex<Option<Settings>>,
    iterations: AtomicU64,
}

impl WorkerShared {
    pub(crate) fn new(id: usize, waker: Arc<mio::Waker>) -> Arc<Self> {
        Arc::new(Self {
            id,
            tasks: TaskQueue::new(),
            removals: RemovalQueue::new(),
            registry: Arc::new(ClientRegistry::new()),
            waker,
            counters: Arc::new(WorkerCounters::new()),
            unhealthy: AtomicBool::new(false),
            pending_settings: Mutex::new(None),
            iterations: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    // Post a task and signal the wakeup handle. Safe from any thread;
    // signals between two waits coalesce into one wakeup.
    pub fn post(&self, task: Task) {
        self.tasks.post(task);
        self.wake();
    }

    pub fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(worker = self.id, error = %err, "wakeup signal failed");
        }
    }

    // Ask the worker to tear a client down. Drained after I/O handling on
    // the owning thread; draining an already-gone client is a no-op.
    pub fn request_removal(&self, client: &Arc<Client>) {
        self.removals.post(client);
        self.wake();
    }

    // Hand the worker a new settings value, applied atomically at the
    // start of its next loop iteration. Posting twice before the drain
    // leaves the second value in effect.
    pub fn queue_reload(&self, settings: Settings) {
        self.post(Box::new(move |core| {
            *core.shared.pending_settings.lock() = Some(settings);
        }));
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn counters(&self) -> &Arc<WorkerCounters> {
        &self.counters
    }

    pub fn client_count(&self) -> usize {
        self.registry.count()
    }

    pub fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::Release);
    }

    // Loop iteration counter, readable across threads. Mostly interesting
    // for observing wakeup coalescing.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    fn note_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    fn drain_tasks(&self) -> Vec<Task> {
        self.tasks.drain()
    }

    fn take_pending_settings(&self) -> Option<Settings> {
        self.pending_settings.lock().take()
    }
}

/// What I/O callbacks get to see of the worker they run on. Auth checks
/// made through `auth` run with this worker's per-thread plugin memory.
pub struct WorkerContext<'a> {
    pub shared: &'a Arc<WorkerShared>,
    pub settings: &'a Settings,
    pub auth: &'a AuthPluginBinding,
    pub router: &'a Arc<dyn SubscriptionStore>,
}

impl WorkerContext<'_> {
    pub fn worker_id(&self) -> usize {
        self.shared.id()
    }

    pub fn counters(&self) -> &WorkerCounters {
        self.shared.counters()
    }
}

// ThreadCore runs one worker: the readiness loop, the keep-alive buckets,
// the stats tick, the plugin binding, and client install/teardown.
pub struct ThreadCore {
    shared: Arc<WorkerShared>,
    fleet: Arc<FleetState>,
    mux: Multiplexer,
    keepalive: KeepAliveScheduler,
    settings: Settings,
    io: Arc<dyn ClientIo>,
    router: Arc<dyn SubscriptionStore>,
    sessions: Arc<dyn SessionStore>,
    auth: AuthPluginBinding,
    stats: StatsPublisher,
    next_plugin_periodic: Instant,
    next_session_sweep: Instant,
    next_token: usize,
    shutdown_phase: ShutdownPhase,
    ready: Vec<ReadyEvent>,
}

impl ThreadCore {
    // Build the worker on its own thread. The plugin's per-thread memory
    // is allocated here, exactly once; AuthPluginBinding's Drop gives it
    // back even when the loop later dies on a fatal error.
    pub(crate) fn new(
        shared: Arc<WorkerShared>,
        fleet: Arc<FleetState>,
        mux: Multiplexer,
        hooks: Hooks,
        settings: Settings,
    ) -> Result<Self, CoreError> {
        let auth = AuthPluginBinding::new(Arc::clone(&hooks.auth), &settings)?;
        let now = Instant::now();
        Ok(Self {
            shared,
            fleet,
            mux,
            keepalive: KeepAliveScheduler::new(),
            stats: StatsPublisher::new(settings.stats_interval, now),
            next_plugin_periodic: now + settings.plugin_periodic_interval,
            next_session_sweep: now + settings.session_expiry_sweep_interval,
            settings,
            io: hooks.io,
            router: hooks.router,
            sessions: hooks.sessions,
            auth,
            next_token: FIRST_CLIENT_TOKEN,
            shutdown_phase: ShutdownPhase::Running,
            ready: Vec::new(),
        })
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn worker_id(&self) -> usize {
        self.shared.id()
    }

    pub(crate) fn fleet(&self) -> &Arc<FleetState> {
        &self.fleet
    }

    // The main loop. Runs until quit has been requested AND both
    // shutdown barriers have been walked by every worker. Errors from
    // individual clients never reach this level; a multiplexer failure
    // does, marks the worker unhealthy and ends it.
    pub(crate) fn run_until_quit(&mut self) -> Result<(), CoreError> {
        let result = self.run_inner();
        if let Err(err) = &result {
            error!(worker = self.shared.id(), error = %err, "worker loop failed");
            self.shared.mark_unhealthy();
        }
        // A worker that dies mid-shutdown must not strand its peers at a
        // barrier.
        self.release_shutdown_barriers();
        result
    }

    fn run_inner(&mut self) -> Result<(), CoreError> {
        self.auth.init(false)?;
        info!(worker = self.shared.id(), "worker started");

        loop {
            self.apply_pending_settings();

            let timeout = self.next_timeout(Instant::now());
            let mut ready = std::mem::take(&mut self.ready);
            let wait = self.mux.wait(timeout, &mut ready);
            self.ready = ready;
            wait?;
            self.shared.note_iteration();

            self.drain_tasks();
            self.dispatch_ready();

            let now = Instant::now();
            for client in self.keepalive.fire_due(now) {
                info!(
                    worker = self.shared.id(),
                    client_id = client.client_id(),
                    keep_alive = client.keep_alive_secs(),
                    "keep-alive exceeded"
                );
                self.begin_disconnect(&client, DisconnectReason::KeepAliveTimeout);
            }
            self.stats
                .on_tick(now, self.shared.id(), &self.fleet.workers, self.router.as_ref());
            if now >= self.next_plugin_periodic {
                self.auth.periodic_event();
                while self.next_plugin_periodic <= now {
                    self.next_plugin_periodic += self.settings.plugin_periodic_interval;
                }
            }
            if now >= self.next_session_sweep {
                let reaped = self.sessions.reap_expired(now);
                if reaped > 0 {
                    debug!(worker = self.shared.id(), reaped, "expired sessions reaped");
                }
                while self.next_session_sweep <= now {
                    self.next_session_sweep += self.settings.session_expiry_sweep_interval;
                }
            }

            self.drain_removals();

            if !self.fleet.coordinator.is_running() && self.advance_shutdown() {
                break;
            }
        }

        self.drain_removals();
        self.auth.deinit(false)?;
        info!(worker = self.shared.id(), "worker stopped");
        Ok(())
    }

    // A reload posted by the fleet becomes visible here, at the start of
    // the iteration after the task ran. Last write wins.
    fn apply_pending_settings(&mut self) {
        let Some(settings) = self.shared.take_pending_settings() else {
            return;
        };
        info!(worker = self.shared.id(), "applying reloaded settings");
        if let Err(err) = self.auth.reload(&settings) {
            error!(worker = self.shared.id(), error = %err, "auth plugin reload failed");
        }
        self.stats.set_interval(settings.stats_interval, Instant::now());
        self.settings = settings;
    }

    // Wait no longer than the nearest timer: keep-alive bucket, stats
    // tick, plugin periodic, session sweep. Capped at one second.
    fn next_timeout(&self, now: Instant) -> Duration {
        if !self.fleet.coordinator.is_running() {
            return SHUTDOWN_POLL_WAIT;
        }
        let mut timeout = MAX_POLL_WAIT;
        if let Some(next) = self.keepalive.next_deadline_in(now) {
            timeout = timeout.min(next);
        }
        timeout = timeout.min(self.stats.next_due_in(now));
        timeout = timeout.min(self.next_plugin_periodic.saturating_duration_since(now));
        timeout = timeout.min(self.next_session_sweep.saturating_duration_since(now));
        timeout
    }

    fn drain_tasks(&mut self) {
        // Tasks posted by these tasks land in the next iteration.
        for task in self.shared.drain_tasks() {
            task(self);
        }
    }

    fn dispatch_ready(&mut self) {
        let ready = std::mem::take(&mut self.ready);
        for event in &ready {
            if event.token == WAKER_TOKEN {
                continue;
            }
            let Some(client) = self.shared.registry().get(event.token) else {
                continue;
            };

            // Reads before writes, and a closed peer still gets one read
            // pass so the protocol driver can observe the EOF.
            if (event.readable || event.closed) && client.is_connected() {
                let outcome = self.io.on_readable(&self.context(), &client);
                self.apply_outcome(&client, outcome);
            }
            if event.writable && client.is_connected() {
                let outcome = self.io.on_writable(&self.context(), &client);
                self.apply_outcome(&client, outcome);
                if client.is_connected() && client.write_buffer().is_empty() {
                    self.update_write_interest(&client, false);
                }
            }
            if event.closed && client.is_connected() {
                self.begin_disconnect(&client, DisconnectReason::ConnectionLost);
            }
        }
        self.ready = ready;
    }

    fn context(&self) -> WorkerContext<'_> {
        WorkerContext {
            shared: &self.shared,
            settings: &self.settings,
            auth: &self.auth,
            router: &self.router,
        }
    }

    fn apply_outcome(&self, client: &Arc<Client>, outcome: IoOutcome) {
        match outcome {
            IoOutcome::Idle => {}
            IoOutcome::NeedsWrite => self.update_write_interest(client, true),
            IoOutcome::Disconnect(reason) => self.begin_disconnect(client, reason),
        }
    }

    fn update_write_interest(&self, client: &Arc<Client>, write: bool) {
        let token = client.handle();
        let result = {
            let mut stream = client.stream();
            self.mux.modify_interest(&mut stream, token, true, write)
        };
        if let Err(err) = result {
            warn!(
                worker = self.shared.id(),
                client_id = client.client_id(),
                error = %err,
                "interest change failed"
            );
            self.begin_disconnect(client, DisconnectReason::ConnectionLost);
        }
    }

    // Decide a client's fate and defer the teardown. The loop never
    // destroys a client while readiness events may still refer to it.
    fn begin_disconnect(&self, client: &Arc<Client>, reason: DisconnectReason) {
        if client.begin_disconnect(reason) {
            self.shared.removals.post(client);
        }
    }

    fn drain_removals(&self) {
        for entry in self.shared.removals.drain() {
            let Some(client) = entry.upgrade() else {
                continue;
            };
            self.teardown(&client);
        }
    }

    // Actual destruction: out of the registry, out of the multiplexer,
    // will published for ungraceful reasons, session released. Safe to
    // reach twice; only the first pass does anything.
    fn teardown(&self, client: &Arc<Client>) {
        if !client.mark_disconnected() {
            return;
        }
        let token = client.handle();
        self.shared.registry().remove(token);
        {
            let mut stream = client.stream();
            if let Err(err) = self.mux.deregister(&mut stream) {
                debug!(worker = self.shared.id(), error = %err, "deregister failed");
            }
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }

        let reason = client
            .disconnect_reason()
            .unwrap_or(DisconnectReason::ConnectionLost);
        if reason.publishes_will() {
            self.publish_will(client);
        } else {
            client.clear_will();
        }

        if let Some(session) = client.session() {
            self.sessions.release(&session, Instant::now());
        }
        self.fleet
            .client_index
            .remove_entry(client.client_id(), self.shared.id(), token.0);
        self.shared.counters().disconnects.inc();
        info!(
            worker = self.shared.id(),
            client_id = client.client_id(),
            reason = %reason,
            "client disconnected"
        );
    }

    // Publish the pending will, if the ACL lets it through. pending_will
    // takes the message off the client, so the shutdown path and the
    // teardown path cannot both deliver it.
    fn publish_will(&self, client: &Arc<Client>) {
        let Some(will) = self.io.pending_will(client) else {
            return;
        };
        let username = client.username().unwrap_or_default();
        let request = AclRequest {
            topic: &will.topic,
            qos: will.qos,
            retain: will.retain,
            payload: &will.payload,
        };
        let verdict =
            self.auth
                .acl_check(AclAccess::Write, client.client_id(), &username, &request);
        if verdict.is_success() {
            self.router.publish(
                &will.topic,
                will.qos,
                will.retain,
                &will.payload,
                &will.user_properties,
            );
        } else {
            info!(
                client_id = client.client_id(),
                topic = %will.topic,
                ?verdict,
                "will publication denied"
            );
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    // Install a connection the acceptor assigned to this worker. Runs as
    // a posted task, so the new client is visible to the same iteration's
    // I/O handling.
    pub fn install_client(&mut self, conn: PendingConnection) {
        if !self.fleet.coordinator.is_running() {
            info!(
                client_id = %conn.meta.client_id,
                "connection dropped, broker is shutting down"
            );
            return;
        }
        let PendingConnection { stream, addr, meta } = conn;
        if let Err(err) = stream.set_nonblocking(true) {
            warn!(error = %err, "could not make connection non-blocking");
            return;
        }
        let mut stream = TcpStream::from_std(stream);

        // The login gate runs on this worker with its plugin memory.
        if let Some(username) = meta.username.as_deref() {
            let verdict = self.auth.login_check(username, meta.password.as_deref(), &[]);
            if !verdict.is_success() {
                info!(
                    worker = self.shared.id(),
                    client_id = %meta.client_id,
                    username,
                    ?verdict,
                    "login denied"
                );
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return;
            }
        }

        let token = self.alloc_token();
        if let Err(err) = self.mux.register(&mut stream, token) {
            warn!(
                worker = self.shared.id(),
                client_id = %meta.client_id,
                error = %err,
                "connection registration failed"
            );
            return;
        }

        let client_id = meta.client_id.clone();
        let session = self.sessions.attach(&meta);
        session.mark_attached();
        let client = Arc::new(Client::new(
            token,
            stream,
            addr,
            meta,
            Arc::clone(self.shared.counters()),
            &self.settings,
        ));
        client.set_session(session);

        if let Err(err) = self.shared.registry().give_client(Arc::clone(&client)) {
            warn!(worker = self.shared.id(), error = %err, "client not inserted");
            let mut stream = client.stream();
            let _ = self.mux.deregister(&mut stream);
            return;
        }
        self.keepalive.schedule(&client, Instant::now());
        self.shared.counters().connects.inc();

        // Session takeover: the newest connection for a client id wins,
        // wherever the previous one lives.
        let previous = self.fleet.client_index.insert(
            client_id.clone(),
            ClientLocation {
                worker: self.shared.id(),
                token: token.0,
            },
        );
        if let Some(previous) = previous {
            if previous.worker == self.shared.id() {
                if previous.token != token.0 {
                    if let Some(old) = self.shared.registry().get(Token(previous.token)) {
                        self.begin_disconnect(&old, DisconnectReason::SessionTakenOver);
                    }
                }
            } else if let Some(peer) = self.fleet.workers.get(previous.worker) {
                let old_token = previous.token;
                peer.post(Box::new(move |core| {
                    core.evict(Token(old_token), DisconnectReason::SessionTakenOver)
                }));
            }
        }

        debug!(
            worker = self.shared.id(),
            client_id = %client_id,
            remote = %addr,
            "client installed"
        );
    }

    // Disconnect a client by handle; a no-op when the handle is already
    // gone. Used by takeover tasks posted from other workers.
    pub fn evict(&mut self, token: Token, reason: DisconnectReason) {
        if let Some(client) = self.shared.registry().get(token) {
            self.begin_disconnect(&client, reason);
        }
    }

    // Append outbound bytes for one client and make sure the loop will
    // flush them. Subscription stores use this from posted tasks to get
    // messages onto peer-worker clients.
    pub fn deliver_to(&mut self, token: Token, frame: &[u8]) {
        let Some(client) = self.shared.registry().get(token) else {
            return;
        };
        if !client.is_connected() {
            return;
        }
        let over = {
            let mut buffer = client.write_buffer();
            buffer.push(frame);
            buffer.over_watermark()
        };
        if over {
            warn!(
                worker = self.shared.id(),
                client_id = client.client_id(),
                "write buffer overflowed"
            );
            self.begin_disconnect(&client, DisconnectReason::WriteBufferOverflow);
            return;
        }
        self.shared.counters().messages_sent.inc();
        self.update_write_interest(&client, true);
    }

    // Walk the shutdown phases. Returns true when the loop may exit:
    // every worker queued its wills AND sent its DISCONNECT frames. In
    // between, the loop keeps servicing tasks and I/O so wills still
    // reach connected subscribers.
    fn advance_shutdown(&mut self) -> bool {
        match self.shutdown_phase {
            ShutdownPhase::Running => {
                let clients = self.shared.registry().snapshot();
                let mut queued = 0usize;
                for client in &clients {
                    if client.has_will() {
                        self.publish_will(client);
                        queued += 1;
                    }
                }
                self.fleet.coordinator.note_wills_queued();
                self.shutdown_phase = ShutdownPhase::WillsQueued;
                info!(worker = self.shared.id(), wills = queued, "shutdown: wills queued");
            }
            ShutdownPhase::WillsQueued => {
                if self.fleet.coordinator.all_wills_queued() {
                    // Every peer published its wills before the barrier
                    // dropped, so their delivery tasks are already queued
                    // here. Run them before any DISCONNECT frame goes out.
                    self.drain_tasks();
                    for client in self.shared.registry().snapshot() {
                        if client.is_connected() {
                            self.io
                                .send_disconnect(&client, DisconnectReason::ServerShutdown);
                            self.begin_disconnect(&client, DisconnectReason::ServerShutdown);
                        }
                    }
                    self.fleet.coordinator.note_disconnects_sent();
                    self.shutdown_phase = ShutdownPhase::DisconnectsSent;
                    info!(worker = self.shared.id(), "shutdown: disconnects sent");
                }
            }
            ShutdownPhase::DisconnectsSent => {
                if self.fleet.coordinator.all_disconnects_sent() {
                    return true;
                }
            }
        }
        false
    }

    fn release_shutdown_barriers(&mut self) {
        if self.shutdown_phase == ShutdownPhase::Running {
            self.fleet.coordinator.note_wills_queued();
            self.shutdown_phase = ShutdownPhase::WillsQueued;
        }
        if self.shutdown_phase == ShutdownPhase::WillsQueued {
            self.fleet.coordinator.note_disconnects_sent();
            self.shutdown_phase = ShutdownPhase::DisconnectsSent;
        }
    }
}
