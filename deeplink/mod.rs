/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Deep-link parsing, buffering and dispatch.

pub mod dispatch;
pub mod queue;
pub mod scheduler;
pub mod url;

use serde::{Deserialize, Serialize};

/// Why a deep link is being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    /// Present when the process started, or handed off by a blocked second
    /// instance before the application was ready.
    Launch,
    /// Arrived while the instance was already live and ready.
    RuntimeOpen,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::RuntimeOpen => "runtime-open",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deferred deep link, owned by the queue until drained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeepLinkEntry {
    pub url: String,
    pub intent: Intent,
}

impl DeepLinkEntry {
    pub fn new(url: impl Into<String>, intent: Intent) -> Self {
        Self {
            url: url.into(),
            intent,
        }
    }
}
