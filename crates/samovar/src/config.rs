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

// src/config.rs
// Worker settings. Each worker keeps a local copy; WorkerFleet::queue_reload
// hands every worker a new value which is applied atomically at the start of
// its next loop iteration (last write wins if several reloads land in the
// same iteration).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_PLUGIN_PERIODIC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_READ_HIGH_WATERMARK: usize = 64 * 1024;
const DEFAULT_WRITE_HIGH_WATERMARK: usize = 1024 * 1024;

// Settings are the per-worker knobs. All fields have default fallbacks so a
// partial YAML document (or none at all) is enough to run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    // stats_interval is how often the $SYS statistics get published.
    // Defaults to DEFAULT_STATS_INTERVAL.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
    // plugin_periodic_interval is how often each worker fires the auth
    // plugin's periodic_event on its own thread.
    // Defaults to DEFAULT_PLUGIN_PERIODIC_INTERVAL.
    #[serde(
        default = "default_plugin_periodic_interval",
        with = "humantime_serde"
    )]
    pub plugin_periodic_interval: Duration,
    // session_expiry_sweep_interval is how often each worker asks the
    // session store to reap expired sessions.
    // Defaults to DEFAULT_SESSION_SWEEP_INTERVAL.
    #[serde(
        default = "default_session_sweep_interval",
        with = "humantime_serde"
    )]
    pub session_expiry_sweep_interval: Duration,
    // read_buffer_high_watermark caps how much unparsed inbound data a
    // client may accumulate before backpressure kicks in.
    #[serde(default = "default_read_high_watermark")]
    pub read_buffer_high_watermark: usize,
    // write_buffer_high_watermark caps how much undelivered outbound data
    // a client may accumulate before it is disconnected as overloaded.
    #[serde(default = "default_write_high_watermark")]
    pub write_buffer_high_watermark: usize,
    // serialize_plugin_init holds a process-wide mutex across plugin
    // init/deinit so thread-unsafe plugin init code can be used.
    #[serde(default)]
    pub serialize_plugin_init: bool,
    // serialize_plugin_auth_checks holds a process-wide mutex across every
    // login/ACL call. This disables auth parallelism across workers; last
    // resort for plugins that are not thread safe at all.
    #[serde(default)]
    pub serialize_plugin_auth_checks: bool,
    // plugin_options is the opaque key/value map handed to every plugin
    // lifecycle call.
    #[serde(default)]
    pub plugin_options: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stats_interval: DEFAULT_STATS_INTERVAL,
            plugin_periodic_interval: DEFAULT_PLUGIN_PERIODIC_INTERVAL,
            session_expiry_sweep_interval: DEFAULT_SESSION_SWEEP_INTERVAL,
            read_buffer_high_watermark: DEFAULT_READ_HIGH_WATERMARK,
            write_buffer_high_watermark: DEFAULT_WRITE_HIGH_WATERMARK,
            serialize_plugin_init: false,
            serialize_plugin_auth_checks: false,
            plugin_options: BTreeMap::new(),
        }
    }
}

impl Settings {
    // Parse settings from a YAML document.
    pub fn from_yaml_str(doc: &str) -> Result<Self, CoreError> {
        Ok(serde_yaml::from_str(doc)?)
    }

    // Read and parse a YAML settings file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let doc = std::fs::read_to_string(path).map_err(CoreError::ConfigIo)?;
        Self::from_yaml_str(&doc)
    }

    // Builder methods that consume and return Self.
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_plugin_periodic_interval(mut self, interval: Duration) -> Self {
        self.plugin_periodic_interval = interval;
        self
    }

    pub fn with_session_expiry_sweep_interval(mut self, interval: Duration) -> Self {
        self.session_expiry_sweep_interval = interval;
        self
    }

    pub fn with_serialize_plugin_init(mut self, serialize: bool) -> Self {
        self.serialize_plugin_init = serialize;
        self
    }

    pub fn with_serialize_plugin_auth_checks(mut self, serialize: bool) -> Self {
        self.serialize_plugin_auth_checks = serialize;
        self
    }

    pub fn with_plugin_option(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.plugin_options.insert(key.into(), value.into());
        self
    }
}

fn default_stats_interval() -> Duration {
    DEFAULT_STATS_INTERVAL
}

fn default_plugin_periodic_interval() -> Duration {
    DEFAULT_PLUGIN_PERIODIC_INTERVAL
}

fn default_session_sweep_interval() -> Duration {
    DEFAULT_SESSION_SWEEP_INTERVAL
}

fn default_read_high_watermark() -> usize {
    DEFAULT_READ_HIGH_WATERMARK
}

fn default_write_high_watermark() -> usize {
    DEFAULT_WRITE_HIGH_WATERMARK
}
