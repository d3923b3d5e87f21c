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

//! The auth backend seam.
//!
//! [`AuthBackend`] is the thread-binding contract for authentication
//! plugins: per-worker opaque memory allocated exactly once, init/deinit
//! with a reload flag, periodic ticks, and the login/ACL/extended-auth
//! checks. [`crate::auth::dylib::DylibAuthPlugin`] binds the dynamic
//! library ABI onto it; tests and embedded deployments implement it
//! directly ([`AllowAllAuth`], [`DenyAllAuth`]).

use std::collections::BTreeMap;
use std::ffi::c_void;

use crate::client::QoS;
use crate::errors::CoreError;

/// The compiled-in plugin ABI version. A loaded plugin must report
/// exactly this from its version symbol.
pub const AUTH_PLUGIN_VERSION: i32 = 1;

/// Result of a plugin auth decision. The integer values are stable ABI;
/// they cross the dynamic-library boundary unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum AuthResult {
    Success = 0,
    AuthMethodNotSupported = 10,
    LoginDenied = 11,
    AclDenied = 12,
    Error = 13,
    /// Only valid while an extended-auth handshake is in flight.
    AuthContinue = -4,
}

impl AuthResult {
    /// Map a raw plugin return onto the enum. Anything unknown is a
    /// malformed return and becomes `Error`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Success,
            10 => Self::AuthMethodNotSupported,
            11 => Self::LoginDenied,
            12 => Self::AclDenied,
            13 => Self::Error,
            -4 => Self::AuthContinue,
            _ => Self::Error,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// The kind of access an ACL check is deciding. Stable ABI integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum AclAccess {
    None = 0,
    Read = 1,
    Write = 2,
    Subscribe = 3,
}

/// Stage of an MQTT 5 extended-auth exchange. Stable ABI integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExtendedAuthStage {
    None = 0,
    Auth = 1,
    Reauth = 2,
    Continue = 3,
}

/// The message an ACL decision is about.
#[derive(Debug)]
pub struct AclRequest<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub retain: bool,
    pub payload: &'a [u8],
}

/// Opaque per-worker plugin memory. The plugin allocates it, the plugin
/// frees it; the core just carries the pointer around and guarantees the
/// calls are matched one-to-one per worker.
#[derive(Debug)]
pub struct ThreadMemory(pub(crate) *mut c_void);

// The pointer travels with its worker thread only between allocation and
// deallocation; the binding never shares it.
unsafe impl Send for ThreadMemory {}

impl ThreadMemory {
    pub fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    /// Wrap a pointer the backend allocated. The backend that created it
    /// is the one that gets it back in `deallocate_thread_memory`.
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0
    }
}

/// Host-side view of an authentication plugin. All methods run on the
/// owning worker thread with that worker's [`ThreadMemory`].
#[allow(clippy::too_many_arguments)]
pub trait AuthBackend: Send + Sync {
    /// Called once per worker, before `init`.
    fn allocate_thread_memory(
        &self,
        options: &BTreeMap<String, String>,
    ) -> Result<ThreadMemory, CoreError>;

    /// Called once per worker, after `deinit`, matched even on fatal
    /// loop exit.
    fn deallocate_thread_memory(&self, memory: ThreadMemory, options: &BTreeMap<String, String>);

    fn init(
        &self,
        memory: &ThreadMemory,
        options: &BTreeMap<String, String>,
        reloading: bool,
    ) -> Result<(), CoreError>;

    fn deinit(
        &self,
        memory: &ThreadMemory,
        options: &BTreeMap<String, String>,
        reloading: bool,
    ) -> Result<(), CoreError>;

    /// Periodic tick on the worker thread, paced by
    /// `Settings::plugin_periodic_interval`.
    fn periodic_event(&self, memory: &ThreadMemory);

    fn login_check(
        &self,
        memory: &ThreadMemory,
        username: &str,
        password: Option<&[u8]>,
        user_properties: &[(String, String)],
    ) -> AuthResult;

    fn acl_check(
        &self,
        memory: &ThreadMemory,
        access: AclAccess,
        client_id: &str,
        username: &str,
        message: &AclRequest<'_>,
    ) -> AuthResult;

    /// One step of an MQTT 5 extended-auth exchange. `return_data` is
    /// filled with the broker's AUTH payload for the peer; `username` may
    /// be rewritten by the plugin.
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
    ) -> AuthResult;
}

/// A backend that admits everything. The fleet default for deployments
/// without an auth plugin.
#[derive(Debug, Default)]
pub struct AllowAllAuth;

impl AuthBackend for AllowAllAuth {
    fn allocate_thread_memory(
        &self,
        _options: &BTreeMap<String, String>,
    ) -> Result<ThreadMemory, CoreError> {
        Ok(ThreadMemory::null())
    }

    fn deallocate_thread_memory(&self, _memory: ThreadMemory, _options: &BTreeMap<String, String>) {}

    fn init(
        &self,
        _memory: &ThreadMemory,
        _options: &BTreeMap<String, String>,
        _reloading: bool,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    fn deinit(
        &self,
        _memory: &ThreadMemory,
        _options: &BTreeMap<String, String>,
        _reloading: bool,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    fn periodic_event(&self, _memory: &ThreadMemory) {}

    fn login_check(
        &self,
        _memory: &ThreadMemory,
        _username: &str,
        _password: Option<&[u8]>,
        _user_properties: &[(String, String)],
    ) -> AuthResult {
        AuthResult::Success
    }

    fn acl_check(
        &self,
        _memory: &ThreadMemory,
        _access: AclAccess,
        _client_id: &str,
        _username: &str,
        _message: &AclRequest<'_>,
    ) -> AuthResult {
        AuthResult::Success
    }

    fn extended_auth(
        &self,
        _memory: &ThreadMemory,
        _client_id: &str,
        _stage: ExtendedAuthStage,
        _method: &str,
        _data: &[u8],
        _user_properties: &[(String, String)],
        _return_data: &mut Vec<u8>,
        _username: &mut String,
    ) -> AuthResult {
        AuthResult::AuthMethodNotSupported
    }
}

/// A backend that denies everything. Useful as a fail-closed default
/// while a real plugin is being wired up.
#[derive(Debug, Default)]
pub struct DenyAllAuth;

impl AuthBackend for DenyAllAuth {
    fn allocate_thread_memory(
        &self,
        _options: &BTreeMap<String, String>,
    ) -> Result<ThreadMemory, CoreError> {
        Ok(ThreadMemory::null())
    }

    fn deallocate_thread_memory(&self, _memory: ThreadMemory, _options: &BTreeMap<String, String>) {}

    fn init(
        &self,
        _memory: &ThreadMemory,
        _options: &BTreeMap<String, String>,
        _reloading: bool,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    fn deinit(
        &self,
        _memory: &ThreadMemory,
        _options: &BTreeMap<String, String>,
        _reloading: bool,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    fn periodic_event(&self, _memory: &ThreadMemory) {}

    fn login_check(
        &self,
        _memory: &ThreadMemory,
        _username: &str,
        _password: Option<&[u8]>,
        _user_properties: &[(String, String)],
    ) -> AuthResult {
        AuthResult::LoginDenied
    }

    fn acl_check(
        &self,
        _memory: &ThreadMemory,
        _access: AclAccess,
        _client_id: &str,
        _username: &str,
        _message: &AclRequest<'_>,
    ) -> AuthResult {
        AuthResult::AclDenied
    }

    fn extended_auth(
        &self,
        _memory: &ThreadMemory,
        _client_id: &str,
        _stage: ExtendedAuthStage,
        _method: &str,
        _data: &[u8],
        _user_properties: &[(String, String)],
        _return_data: &mut Vec<u8>,
        _username: &mut String,
    ) -> AuthResult {
        AuthResult::AuthMethodNotSupported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_result_integers_are_stable() {
        assert_eq!(AuthResult::Success.as_raw(), 0);
        assert_eq!(AuthResult::AuthMethodNotSupported.as_raw(), 10);
        assert_eq!(AuthResult::LoginDenied.as_raw(), 11);
        assert_eq!(AuthResult::AclDenied.as_raw(), 12);
        assert_eq!(AuthResult::Error.as_raw(), 13);
        assert_eq!(AuthResult::AuthContinue.as_raw(), -4);
    }

    #[test]
    fn malformed_raw_results_become_error() {
        assert_eq!(AuthResult::from_raw(99), AuthResult::Error);
        assert_eq!(AuthResult::from_raw(-1), AuthResult::Error);
        assert_eq!(AuthResult::from_raw(-4), AuthResult::AuthContinue);
        assert_eq!(AuthResult::from_raw(0), AuthResult::Success);
    }

    #[test]
    fn acl_access_integers_are_stable() {
        assert_eq!(AclAccess::None as i32, 0);
        assert_eq!(AclAccess::Read as i32, 1);
        assert_eq!(AclAccess::Write as i32, 2);
        assert_eq!(AclAccess::Subscribe as i32, 3);
    }
}
