/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::BTreeSet;

use crate::registries::atomic::protocol::ProtocolSet;

/// OS-side protocol handler registration. Calls are best-effort and
/// idempotent; a refusal for one scheme never blocks the others.
pub trait ProtocolRegistrar: Send {
    fn register_scheme(&mut self, scheme: &str) -> bool;
    fn unregister_scheme(&mut self, scheme: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationReport {
    pub scheme: String,
    pub registered: bool,
}

pub fn register_all(
    registrar: &mut dyn ProtocolRegistrar,
    protocols: &ProtocolSet,
) -> Vec<RegistrationReport> {
    protocols
        .iter()
        .map(|scheme| {
            let registered = registrar.register_scheme(scheme);
            if registered {
                log::info!("registered protocol handler for {scheme}://");
            } else {
                log::error!("failed to register protocol handler for {scheme}://");
            }
            RegistrationReport {
                scheme: scheme.to_string(),
                registered,
            }
        })
        .collect()
}

/// Reports carry `registered = false` for every scheme the OS no longer
/// routes to this application.
pub fn unregister_all(
    registrar: &mut dyn ProtocolRegistrar,
    protocols: &ProtocolSet,
) -> Vec<RegistrationReport> {
    protocols
        .iter()
        .map(|scheme| {
            let removed = registrar.unregister_scheme(scheme);
            if removed {
                log::info!("unregistered protocol handler for {scheme}://");
            } else {
                log::warn!("could not unregister protocol handler for {scheme}://");
            }
            RegistrationReport {
                scheme: scheme.to_string(),
                registered: !removed,
            }
        })
        .collect()
}

/// Tracks registrations for the lifetime of the process only. Hosts that
/// persist OS handler entries supply their own [`ProtocolRegistrar`].
#[derive(Debug, Default)]
pub struct SessionRegistrar {
    registered: BTreeSet<String>,
}

impl SessionRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, scheme: &str) -> bool {
        self.registered.contains(scheme)
    }
}

impl ProtocolRegistrar for SessionRegistrar {
    fn register_scheme(&mut self, scheme: &str) -> bool {
        self.registered.insert(scheme.to_string());
        true
    }

    fn unregister_scheme(&mut self, scheme: &str) -> bool {
        self.registered.remove(scheme);
        true
    }
}
