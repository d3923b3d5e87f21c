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

//! Authentication plugin binding.
//!
//! This module provides the per-worker binding to a host-provided
//! authentication plugin:
//!
//! - [`AuthBackend`]: the trait a plugin (or in-process stand-in) implements
//! - [`AuthPluginBinding`]: per-worker lifecycle enforcement (thread memory
//!   allocated once, init/deinit matched, reload without re-allocation) and
//!   panic containment
//! - [`dylib::DylibAuthPlugin`]: binding for the dynamic-library C ABI
//! - [`AllowAllAuth`] / [`DenyAllAuth`]: trivial built-ins
//!
//! Every check runs synchronously on the owning worker thread with that
//! worker's opaque plugin memory. A plugin that panics or returns garbage
//! costs that one check (`AuthResult::Error`), never the worker.

pub mod dylib;
mod traits;

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::errors::CoreError;

pub use traits::{
    AUTH_PLUGIN_VERSION, AclAccess, AclRequest, AllowAllAuth, AuthBackend, AuthResult,
    DenyAllAuth, ExtendedAuthStage, ThreadMemory,
};

// Process-wide locks backing the two serialization modes. Held only when
// the corresponding Settings flag asks for it.
static PLUGIN_INIT_LOCK: Mutex<()> = Mutex::new(());
static PLUGIN_CHECK_LOCK: Mutex<()> = Mutex::new(());

// AuthPluginBinding owns one worker's relationship with the auth plugin:
// the opaque thread memory, the init state, and the serialization flags.
// It is created on the worker thread before the loop starts and dropped
// after the loop exits; Drop matches the deallocation even when the loop
// died on a fatal error.
pub struct AuthPluginBinding {
    backend: Arc<dyn AuthBackend>,
    memory: Option<ThreadMemory>,
    options: BTreeMap<String, String>,
    serialize_init: bool,
    serialize_checks: bool,
    initialized: bool,
}

impl AuthPluginBinding {
    // Allocate the plugin's per-thread memory. Called exactly once per
    // worker; init() follows separately so a reload can re-init without
    // touching the allocation.
    pub fn new(backend: Arc<dyn AuthBackend>, settings: &Settings) -> Result<Self, CoreError> {
        let options = settings.plugin_options.clone();
        let memory = backend.allocate_thread_memory(&options)?;
        Ok(Self {
            backend,
            memory: Some(memory),
            options,
            serialize_init: settings.serialize_plugin_init,
            serialize_checks: settings.serialize_plugin_auth_checks,
            initialized: false,
        })
    }

    fn memory(&self) -> &ThreadMemory {
        // The Option is only emptied in Drop.
        self.memory.as_ref().expect("plugin thread memory present")
    }

    pub fn init(&mut self, reloading: bool) -> Result<(), CoreError> {
        let _guard = self.serialize_init.then(|| PLUGIN_INIT_LOCK.lock());
        self.backend.init(self.memory(), &self.options, reloading)?;
        self.initialized = true;
        Ok(())
    }

    pub fn deinit(&mut self, reloading: bool) -> Result<(), CoreError> {
        if !self.initialized {
            return Ok(());
        }
        let _guard = self.serialize_init.then(|| PLUGIN_INIT_LOCK.lock());
        self.backend
            .deinit(self.memory(), &self.options, reloading)?;
        self.initialized = false;
        Ok(())
    }

    // Apply a settings reload: deinit(reloading=true), swap the options
    // and flags, init(reloading=true). The thread memory is untouched.
    pub fn reload(&mut self, settings: &Settings) -> Result<(), CoreError> {
        self.deinit(true)?;
        self.options = settings.plugin_options.clone();
        self.serialize_init = settings.serialize_plugin_init;
        self.serialize_checks = settings.serialize_plugin_auth_checks;
        self.init(true)
    }

    pub fn periodic_event(&self) {
        let backend = &self.backend;
        let memory = self.memory();
        if catch_unwind(AssertUnwindSafe(|| backend.periodic_event(memory))).is_err() {
            error!("auth plugin panicked in periodic_event");
        }
    }

    pub fn login_check(
        &self,
        username: &str,
        password: Option<&[u8]>,
        user_properties: &[(String, String)],
    ) -> AuthResult {
        let result = self.contained(|backend, memory| {
            backend.login_check(memory, username, password, user_properties)
        });
        // AuthContinue makes sense only inside an extended-auth exchange.
        if result == AuthResult::AuthContinue {
            error!(username, "plugin returned AuthContinue from login_check");
            return AuthResult::Error;
        }
        result
    }

    pub fn acl_check(
        &self,
        access: AclAccess,
        client_id: &str,
        username: &str,
        message: &AclRequest<'_>,
    ) -> AuthResult {
        let result = self.contained(|backend, memory| {
            backend.acl_check(memory, access, client_id, username, message)
        });
        if result == AuthResult::AuthContinue {
            error!(client_id, "plugin returned AuthContinue from acl_check");
            return AuthResult::Error;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    pub fn extended_auth(
        &self,
        client_id: &str,
        stage: ExtendedAuthStage,
        method: &str,
        data: &[u8],
        user_properties: &[(String, String)],
        return_data: &mut Vec<u8>,
        username: &mut String,
    ) -> AuthResult {
        let backend = &self.backend;
        let memory = self.memory();
        let _guard = self.serialize_checks.then(|| PLUGIN_CHECK_LOCK.lock());
        match catch_unwind(AssertUnwindSafe(|| {
            backend.extended_auth(
                memory,
                client_id,
                stage,
                method,
                data,
                user_properties,
                return_data,
                username,
            )
        })) {
            Ok(result) => result,
            Err(_) => {
                error!(client_id, "auth plugin panicked in extended_auth");
                AuthResult::Error
            }
        }
    }

    // Run a check with the serialization lock (when configured) and panic
    // containment: a plugin that unwinds costs this one check, not the
    // worker.
    fn contained(
        &self,
        call: impl FnOnce(&dyn AuthBackend, &ThreadMemory) -> AuthResult,
    ) -> AuthResult {
        let _guard = self.serialize_checks.then(|| PLUGIN_CHECK_LOCK.lock());
        match catch_unwind(AssertUnwindSafe(|| {
            call(self.backend.as_ref(), self.memory())
        })) {
            Ok(result) => result,
            Err(_) => {
                error!("auth plugin panicked during auth check");
                AuthResult::Error
            }
        }
    }
}

impl Drop for AuthPluginBinding {
    fn drop(&mut self) {
        // Matched shutdown even when the loop exited on a fatal error:
        // deinit if still initialized, then give the memory back.
        if self.initialized {
            if let Err(err) = self.deinit(false) {
                warn!(error = %err, "auth plugin deinit failed during teardown");
            }
        }
        if let Some(memory) = self.memory.take() {
            let backend = Arc::clone(&self.backend);
            let options = std::mem::take(&mut self.options);
            if catch_unwind(AssertUnwindSafe(|| {
                backend.deallocate_thread_memory(memory, &options)
            }))
            .is_err()
            {
                error!("auth plugin panicked in deallocate_thread_memory");
            } else {
                debug!("auth plugin thread memory released");
            }
        }
    }
}
