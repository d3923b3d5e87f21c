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

// src/auth/dylib.rs
// Dynamic-library binding of the auth plugin ABI. The plugin exports a set
// of samovar_plugin_* C symbols; this module resolves them once at load
// time, verifies the version tag, and marshals Rust arguments across the
// boundary. The AuthResult integers and LOG_* flags are stable ABI.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::path::Path;

use libloading::Library;
use tracing::{debug, error, info, warn};

use super::traits::{
    AUTH_PLUGIN_VERSION, AclAccess, AclRequest, AuthBackend, AuthResult, ExtendedAuthStage,
    ThreadMemory,
};
use crate::errors::CoreError;

// Log levels a plugin may pass to the broker-provided log callback.
pub const LOG_INFO: c_int = 0x01;
pub const LOG_NOTICE: c_int = 0x02;
pub const LOG_WARNING: c_int = 0x04;
pub const LOG_ERR: c_int = 0x08;
pub const LOG_DEBUG: c_int = 0x10;
pub const LOG_SUBSCRIBE: c_int = 0x20;
pub const LOG_UNSUBSCRIBE: c_int = 0x40;

// One key/value entry of the options map as it crosses the ABI.
#[repr(C)]
pub struct PluginOption {
    pub key: *const c_char,
    pub value: *const c_char,
}

// The log callback the broker hands to the plugin.
pub type PluginLogFn = extern "C" fn(level: c_int, message: *const c_char);

type VersionFn = unsafe extern "C" fn() -> c_int;
type SetLogCallbackFn = unsafe extern "C" fn(PluginLogFn);
type AllocateFn = unsafe extern "C" fn(*mut *mut c_void, *const PluginOption, usize);
type DeallocateFn = unsafe extern "C" fn(*mut c_void, *const PluginOption, usize);
type InitFn = unsafe extern "C" fn(*mut c_void, *const PluginOption, usize, c_int) -> c_int;
type DeinitFn = unsafe extern "C" fn(*mut c_void, *const PluginOption, usize, c_int) -> c_int;
type PeriodicEventFn = unsafe extern "C" fn(*mut c_void);
type LoginCheckFn = unsafe extern "C" fn(
    *mut c_void,
    *const c_char, // username
    *const u8,     // password (may be null)
    usize,         // password length
    *const PluginOption,
    usize,
) -> c_int;
type AclCheckFn = unsafe extern "C" fn(
    *mut c_void,
    c_int,         // access
    *const c_char, // client id
    *const c_char, // username
    *const c_char, // topic
    u8,            // qos
    c_int,         // retain
    *const u8,     // payload
    usize,
) -> c_int;
type ExtendedAuthFn = unsafe extern "C" fn(
    *mut c_void,
    *const c_char, // client id
    c_int,         // stage
    *const c_char, // method
    *const u8,     // auth data
    usize,
    *const PluginOption,
    usize,
    *mut u8, // return data buffer
    usize,   // return data capacity
    *mut usize, // return data length
    *mut c_char, // username in/out buffer
    usize,       // username capacity
) -> c_int;

const RETURN_DATA_CAPACITY: usize = 8 * 1024;
const USERNAME_CAPACITY: usize = 256;

// Routes plugin log lines into the broker's tracing output.
extern "C" fn plugin_log_bridge(level: c_int, message: *const c_char) {
    if message.is_null() {
        return;
    }
    let text = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    let text = text.as_ref();
    match level {
        LOG_DEBUG => debug!(target: "samovar::plugin", "{text}"),
        LOG_WARNING => warn!(target: "samovar::plugin", "{text}"),
        LOG_ERR => error!(target: "samovar::plugin", "{text}"),
        LOG_SUBSCRIBE | LOG_UNSUBSCRIBE => info!(target: "samovar::plugin::subscriptions", "{text}"),
        // LOG_INFO, LOG_NOTICE and anything unknown.
        _ => info!(target: "samovar::plugin", "{text}"),
    }
}

// Owned CStrings plus the pointer array handed to the plugin. The strings
// must outlive every use of entries_ptr().
struct OptionArray {
    _strings: Vec<CString>,
    entries: Vec<PluginOption>,
}

impl OptionArray {
    fn build(options: &BTreeMap<String, String>) -> Result<Self, CoreError> {
        let mut strings = Vec::with_capacity(options.len() * 2);
        let mut entries = Vec::with_capacity(options.len());
        for (key, value) in options {
            let key = CString::new(key.as_str())
                .map_err(|_| CoreError::plugin(format!("option key has NUL byte: {key:?}")))?;
            let value = CString::new(value.as_str())
                .map_err(|_| CoreError::plugin(format!("option value has NUL byte for {key:?}")))?;
            entries.push(PluginOption {
                key: key.as_ptr(),
                value: value.as_ptr(),
            });
            strings.push(key);
            strings.push(value);
        }
        Ok(Self {
            _strings: strings,
            entries,
        })
    }

    fn as_ptr(&self) -> *const PluginOption {
        if self.entries.is_empty() {
            std::ptr::null()
        } else {
            self.entries.as_ptr()
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn c_string(value: &str, what: &str) -> Option<CString> {
    match CString::new(value) {
        Ok(s) => Some(s),
        Err(_) => {
            error!("{what} contains a NUL byte, rejecting plugin call");
            None
        }
    }
}

// DylibAuthPlugin holds the loaded library and the resolved entry points.
// The function pointers stay valid for as long as the Library is mapped;
// it is the last field so it outlives every resolved pointer.
pub struct DylibAuthPlugin {
    allocate: AllocateFn,
    deallocate: DeallocateFn,
    init: InitFn,
    deinit: DeinitFn,
    periodic_event: PeriodicEventFn,
    login_check: LoginCheckFn,
    acl_check: AclCheckFn,
    extended_auth: ExtendedAuthFn,
    _library: Library,
}

impl DylibAuthPlugin {
    // Open the plugin, verify its version tag, resolve every required
    // symbol, and hand it the broker log callback if it wants one.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path) }?;

        let version: VersionFn = unsafe { *library.get(b"samovar_plugin_version\0")? };
        let found = unsafe { version() };
        if found != AUTH_PLUGIN_VERSION {
            return Err(CoreError::PluginVersionMismatch {
                expected: AUTH_PLUGIN_VERSION,
                found,
            });
        }

        // The log callback hookup is optional.
        if let Ok(set_log) =
            unsafe { library.get::<SetLogCallbackFn>(b"samovar_plugin_set_log_callback\0") }
        {
            unsafe { set_log(plugin_log_bridge) };
        }

        let plugin = Self {
            allocate: unsafe { *library.get(b"samovar_plugin_allocate_thread_memory\0")? },
            deallocate: unsafe { *library.get(b"samovar_plugin_deallocate_thread_memory\0")? },
            init: unsafe { *library.get(b"samovar_plugin_init\0")? },
            deinit: unsafe { *library.get(b"samovar_plugin_deinit\0")? },
            periodic_event: unsafe { *library.get(b"samovar_plugin_periodic_event\0")? },
            login_check: unsafe { *library.get(b"samovar_plugin_login_check\0")? },
            acl_check: unsafe { *library.get(b"samovar_plugin_acl_check\0")? },
            extended_auth: unsafe { *library.get(b"samovar_plugin_extended_auth\0")? },
            _library: library,
        };
        info!(path = %path.display(), version = found, "auth plugin loaded");
        Ok(plugin)
    }
}

impl AuthBackend for DylibAuthPlugin {
    fn allocate_thread_memory(
        &self,
        options: &BTreeMap<String, String>,
    ) -> Result<ThreadMemory, CoreError> {
        let options = OptionArray::build(options)?;
        let mut memory: *mut c_void = std::ptr::null_mut();
        unsafe { (self.allocate)(&mut memory, options.as_ptr(), options.len()) };
        Ok(ThreadMemory(memory))
    }

    fn deallocate_thread_memory(&self, memory: ThreadMemory, options: &BTreeMap<String, String>) {
        match OptionArray::build(options) {
            Ok(options) => unsafe {
                (self.deallocate)(memory.0, options.as_ptr(), options.len())
            },
            Err(err) => {
                // Free with an empty map rather than leaking the memory.
                warn!(error = %err, "plugin options unusable during deallocation");
                unsafe { (self.deallocate)(memory.0, std::ptr::null(), 0) }
            }
        }
    }

    fn init(
        &self,
        memory: &ThreadMemory,
        options: &BTreeMap<String, String>,
        reloading: bool,
    ) -> Result<(), CoreError> {
        let options = OptionArray::build(options)?;
        let rc =
            unsafe { (self.init)(memory.0, options.as_ptr(), options.len(), reloading as c_int) };
        if rc != 0 {
            return Err(CoreError::plugin(format!("plugin init returned {rc}")));
        }
        Ok(())
    }

    fn deinit(
        &self,
        memory: &ThreadMemory,
        options: &BTreeMap<String, String>,
        reloading: bool,
    ) -> Result<(), CoreError> {
        let options = OptionArray::build(options)?;
        let rc =
            unsafe { (self.deinit)(memory.0, options.as_ptr(), options.len(), reloading as c_int) };
        if rc != 0 {
            return Err(CoreError::plugin(format!("plugin deinit returned {rc}")));
        }
        Ok(())
    }

    fn periodic_event(&self, memory: &ThreadMemory) {
        unsafe { (self.periodic_event)(memory.0) };
    }

    fn login_check(
        &self,
        memory: &ThreadMemory,
        username: &str,
        password: Option<&[u8]>,
        user_properties: &[(String, String)],
    ) -> AuthResult {
        let props: BTreeMap<String, String> = user_properties.iter().cloned().collect();
        let (Some(username), Ok(props)) = (c_string(username, "username"), OptionArray::build(&props))
        else {
            return AuthResult::Error;
        };
        let (password_ptr, password_len) = match password {
            Some(bytes) => (bytes.as_ptr(), bytes.len()),
            None => (std::ptr::null(), 0),
        };
        let rc = unsafe {
            (self.login_check)(
                memory.0,
                username.as_ptr(),
                password_ptr,
                password_len,
                props.as_ptr(),
                props.len(),
            )
        };
        AuthResult::from_raw(rc)
    }

    fn acl_check(
        &self,
        memory: &ThreadMemory,
        access: AclAccess,
        client_id: &str,
        username: &str,
        message: &AclRequest<'_>,
    ) -> AuthResult {
        let (Some(client_id), Some(username), Some(topic)) = (
            c_string(client_id, "client id"),
            c_string(username, "username"),
            c_string(message.topic, "topic"),
        ) else {
            return AuthResult::Error;
        };
        let rc = unsafe {
            (self.acl_check)(
                memory.0,
                access as c_int,
                client_id.as_ptr(),
                username.as_ptr(),
                topic.as_ptr(),
                message.qos.as_u8(),
                message.retain as c_int,
                message.payload.as_ptr(),
                message.payload.len(),
            )
        };
        AuthResult::from_raw(rc)
    }

    fn extended_auth(
        &self,
        memory: &ThreadMemory,
        client_id: &str,
        stage: ExtendedAuthStage,
        method: &str,
        data: &[u8],
        user_properties: &[(String, String)],
        return_data: &mut Vec<u8>,
        username: &mut String,
    ) -> AuthResult {
        let props: BTreeMap<String, String> = user_properties.iter().cloned().collect();
        let (Some(client_id), Some(method), Ok(props)) = (
            c_string(client_id, "client id"),
            c_string(method, "auth method"),
            OptionArray::build(&props),
        ) else {
            return AuthResult::Error;
        };

        let mut return_buf = vec![0u8; RETURN_DATA_CAPACITY];
        let mut return_len: usize = 0;
        // The username crosses the boundary in a fixed buffer the plugin
        // may rewrite in place.
        let mut username_buf = vec![0u8; USERNAME_CAPACITY];
        let seed = username.as_bytes();
        let seed_len = seed.len().min(USERNAME_CAPACITY - 1);
        username_buf[..seed_len].copy_from_slice(&seed[..seed_len]);

        let rc = unsafe {
            (self.extended_auth)(
                memory.0,
                client_id.as_ptr(),
                stage as c_int,
                method.as_ptr(),
                data.as_ptr(),
                data.len(),
                props.as_ptr(),
                props.len(),
                return_buf.as_mut_ptr(),
                return_buf.len(),
                &mut return_len,
                username_buf.as_mut_ptr() as *mut c_char,
                username_buf.len(),
            )
        };

        return_data.clear();
        let return_len = return_len.min(return_buf.len());
        return_data.extend_from_slice(&return_buf[..return_len]);

        let terminator = username_buf
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(username_buf.len());
        *username = String::from_utf8_lossy(&username_buf[..terminator]).into_owned();

        AuthResult::from_raw(rc)
    }
}
