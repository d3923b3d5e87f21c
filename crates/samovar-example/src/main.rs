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

// src/main.rs
// PoC/demo of the samovar worker core: a worker fleet speaking the
// line protocol from samovar::mem over plain TCP. Try it with a couple
// of netcat sessions:
//
//   nc localhost 7878        # terminal 1
//   sub status/+
//
//   nc localhost 7878        # terminal 2
//   pub status/kettle boiling

use std::net::TcpListener;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use samovar::mem::{LineProtoIo, MemorySessionStore, MemorySubscriptionStore};
use samovar::{
    AllowAllAuth, Bytes, ConnectMeta, Hooks, PendingConnection, ProtocolVersion, QoS, Settings,
    SubscriptionStore, WillMessage, WorkerFleet,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "samovar-example")]
#[command(about = "Demo broker built on the samovar worker core.", long_about = None)]
struct Cli {
    // Address to listen on
    #[arg(long, default_value = "127.0.0.1:7878")]
    listen: String,

    // Number of worker threads
    #[arg(long, default_value = "4")]
    workers: usize,

    // Keep-alive seconds negotiated for every connection (0 disables)
    #[arg(long, default_value = "30")]
    keep_alive: u16,

    // Optional YAML settings file
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => match Settings::from_yaml_file(path) {
            Ok(settings) => settings,
            Err(err) => {
                error!(error = %err, "could not load settings");
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };

    let store = Arc::new(MemorySubscriptionStore::new());
    let hooks = Hooks {
        io: Arc::new(LineProtoIo::new(Arc::clone(&store))),
        router: Arc::clone(&store) as Arc<dyn SubscriptionStore>,
        sessions: Arc::new(MemorySessionStore::new()),
        auth: Arc::new(AllowAllAuth),
    };

    let fleet = match WorkerFleet::start(cli.workers, settings, hooks) {
        Ok(fleet) => fleet,
        Err(err) => {
            error!(error = %err, "fleet start failed");
            return ExitCode::FAILURE;
        }
    };

    let listener = match TcpListener::bind(&cli.listen) {
        Ok(listener) => listener,
        Err(err) => {
            error!(listen = %cli.listen, error = %err, "bind failed");
            return ExitCode::FAILURE;
        }
    };
    info!(listen = %cli.listen, workers = cli.workers, "accepting connections");

    let mut connection_seq = 0u64;
    loop {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        connection_seq += 1;
        let client_id = format!("conn-{connection_seq}");
        let meta = ConnectMeta {
            protocol: ProtocolVersion::V3_1_1,
            keep_alive_secs: cli.keep_alive,
            will: Some(WillMessage {
                topic: format!("status/{client_id}"),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtMostOnce,
                retain: false,
                user_properties: Vec::new(),
            }),
            ..ConnectMeta::new(client_id)
        };
        match fleet.assign(PendingConnection::new(stream, addr, meta)) {
            Ok(()) => {}
            Err(samovar::CoreError::ShuttingDown) => break,
            Err(err) => warn!(error = %err, "connection not assigned"),
        }
    }

    match fleet.shutdown() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fleet exited with an error");
            ExitCode::FAILURE
        }
    }
}
