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

// src/errors.rs
// Error types for error handling throughout the broker worker core.

use thiserror::Error;

// CoreError covers the error conditions of the worker core. Per-client
// failures are contained inside the event loop (the client gets
// disconnected); only the variants flagged by is_fatal() take the whole
// worker down.
#[derive(Error, Debug)]
pub enum CoreError {
    // RegistrationFailed occurs when the readiness multiplexer rejects a
    // new connection handle. The connection is dropped, the worker lives.
    #[error("event loop registration failed: {0}")]
    RegistrationFailed(#[source] std::io::Error),
    // DuplicateHandle occurs when a connection handle is inserted into a
    // registry that already tracks it.
    #[error("duplicate connection handle: {0}")]
    DuplicateHandle(usize),
    // Multiplexer occurs when the readiness wait itself fails. There is
    // no way to keep serving clients without it.
    #[error("multiplexer failure: {0}")]
    Multiplexer(#[source] std::io::Error),
    // WakeupHandleLost occurs when the cross-thread wakeup handle cannot
    // be created or signaled. Cross-thread task injection is broken at
    // that point.
    #[error("wakeup handle lost: {0}")]
    WakeupHandleLost(#[source] std::io::Error),
    // ThreadStart occurs when a worker OS thread cannot be spawned.
    #[error("worker thread start failed: {0}")]
    ThreadStart(#[source] std::io::Error),
    // WorkerPanicked occurs when a worker thread died with a panic
    // instead of returning through its own error path.
    #[error("worker thread panicked")]
    WorkerPanicked,
    // NoHealthyWorkers occurs when every worker has latched its
    // unhealthy flag and a connection cannot be assigned anywhere.
    #[error("no healthy workers available")]
    NoHealthyWorkers,
    // ShuttingDown occurs when a connection is offered to a fleet that
    // has already been asked to quit.
    #[error("broker is shutting down")]
    ShuttingDown,
    // PluginVersionMismatch occurs when a loaded auth plugin reports an
    // ABI version other than the compiled-in one.
    #[error("auth plugin ABI version {found}, expected {expected}")]
    PluginVersionMismatch { expected: i32, found: i32 },
    // PluginLoad occurs when the auth plugin library cannot be opened or
    // a required symbol is missing.
    #[error("auth plugin library error: {0}")]
    PluginLoad(#[from] libloading::Error),
    // Plugin occurs when a plugin call fails outright (allocation,
    // init/deinit, malformed strings crossing the ABI).
    #[error("auth plugin failure: {0}")]
    Plugin(String),
    // ConfigParse occurs when a settings document cannot be deserialized.
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
    // ConfigIo occurs when a settings file cannot be read.
    #[error("configuration read error: {0}")]
    ConfigIo(#[source] std::io::Error),
}

// Convenience implementations for creating common error types.
impl CoreError {
    // Create a RegistrationFailed error from a multiplexer rejection.
    pub fn registration_failed(err: std::io::Error) -> Self {
        Self::RegistrationFailed(err)
    }

    // Create a Multiplexer error from a failed readiness wait.
    pub fn multiplexer(err: std::io::Error) -> Self {
        Self::Multiplexer(err)
    }

    // Create a Plugin error with a descriptive message.
    pub fn plugin(message: impl Into<String>) -> Self {
        Self::Plugin(message.into())
    }

    // Check if this error must take the worker down. Everything else is
    // contained by disconnecting the affected client.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Multiplexer(_) | Self::WakeupHandleLost(_) | Self::ThreadStart(_)
        )
    }

    // Check if this error is related to the auth plugin.
    pub fn is_plugin_error(&self) -> bool {
        matches!(
            self,
            Self::PluginVersionMismatch { .. } | Self::PluginLoad(_) | Self::Plugin(_)
        )
    }
}
