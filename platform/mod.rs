/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Per-OS launch-argument policy.
//!
//! Each platform is a stateless strategy picked once at startup from
//! [`PlatformKind::current`]. Launchers place the deep-link argument
//! differently per OS, so the scan order is part of the platform contract.

pub mod registrar;

use crate::registries::atomic::protocol::ProtocolSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformKind {
    MacOs,
    Windows,
    Linux,
}

impl PlatformKind {
    /// Runtime platform check. Unknown Unix-likes share the Linux policy.
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "macos" | "ios" => Self::MacOs,
            "windows" => Self::Windows,
            _ => Self::Linux,
        }
    }

    pub fn strategy(self) -> &'static dyn PlatformStrategy {
        match self {
            Self::MacOs => &MacOsStrategy,
            Self::Windows => &WindowsStrategy,
            Self::Linux => &LinuxStrategy,
        }
    }
}

/// Installer lifecycle events delivered as the first launch argument
/// (Squirrel on Windows). The process handles the event and exits without
/// ever taking the instance lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupEvent {
    Install,
    Updated,
    Uninstall,
    Obsolete,
}

impl StartupEvent {
    pub fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "--squirrel-install" => Some(Self::Install),
            "--squirrel-updated" => Some(Self::Updated),
            "--squirrel-uninstall" => Some(Self::Uninstall),
            "--squirrel-obsolete" => Some(Self::Obsolete),
            _ => None,
        }
    }

    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Install => "--squirrel-install",
            Self::Updated => "--squirrel-updated",
            Self::Uninstall => "--squirrel-uninstall",
            Self::Obsolete => "--squirrel-obsolete",
        }
    }
}

pub trait PlatformStrategy: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Finds the one argument that looks like a deep link for `protocols`.
    fn extract_deep_link(&self, argv: &[String], protocols: &ProtocolSet) -> Option<String>;

    fn detect_startup_event(&self, _argv: &[String]) -> Option<StartupEvent> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MacOsStrategy;

#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxStrategy;

#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsStrategy;

impl PlatformStrategy for MacOsStrategy {
    fn kind(&self) -> PlatformKind {
        PlatformKind::MacOs
    }

    fn extract_deep_link(&self, argv: &[String], protocols: &ProtocolSet) -> Option<String> {
        scan_front_to_back(argv, protocols)
    }
}

impl PlatformStrategy for LinuxStrategy {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Linux
    }

    fn extract_deep_link(&self, argv: &[String], protocols: &ProtocolSet) -> Option<String> {
        scan_front_to_back(argv, protocols)
    }
}

impl PlatformStrategy for WindowsStrategy {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Windows
    }

    // Installers and shell launches append the URL last.
    fn extract_deep_link(&self, argv: &[String], protocols: &ProtocolSet) -> Option<String> {
        argv.iter()
            .rev()
            .find(|arg| protocols.matches_url(arg))
            .cloned()
    }

    fn detect_startup_event(&self, argv: &[String]) -> Option<StartupEvent> {
        argv.get(1).and_then(|arg| StartupEvent::from_arg(arg))
    }
}

fn scan_front_to_back(argv: &[String], protocols: &ProtocolSet) -> Option<String> {
    argv.iter().find(|arg| protocols.matches_url(arg)).cloned()
}
