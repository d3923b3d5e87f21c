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

// src/lib.rs
// samovar: the worker-thread core of an MQTT broker. N pinned workers,
// each a single-threaded readiness loop owning its clients; cross-thread
// influence only via task queues; keep-alive, wills, $SYS stats and the
// auth plugin lifecycle driven from the loops. Packet codecs, topic
// matching and persistence plug in through the traits module.

pub mod auth;
pub mod client;
pub mod config;
pub mod counters;
pub mod errors;
pub mod fleet;
pub mod mem;
pub mod session;
pub mod shutdown;
pub mod stats;
pub mod traits;
pub mod worker;

#[cfg(test)]
mod test_support;

// Export some things for convenience.
pub use bytes::Bytes;

pub use auth::{
    AclAccess, AclRequest, AllowAllAuth, AuthBackend, AuthPluginBinding, AuthResult, DenyAllAuth,
    ExtendedAuthStage, ThreadMemory,
};
pub use client::{
    Client, ConnectMeta, DisconnectReason, FlowBuffer, ProtocolVersion, QoS, WillMessage,
};
pub use config::Settings;
pub use counters::{DerivableCounter, WorkerCounters};
pub use errors::CoreError;
pub use fleet::{PendingConnection, WorkerFleet};
pub use session::{QueuedPublish, Session};
pub use shutdown::ShutdownCoordinator;
pub use stats::{StatsPublisher, StatsSnapshot};
pub use traits::{ClientIo, Hooks, IoOutcome, SessionStore, SubscriptionStore};
pub use worker::{ClientRegistry, KeepAliveScheduler, ThreadCore, WorkerContext, WorkerShared};
