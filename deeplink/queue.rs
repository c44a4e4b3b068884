/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! FIFO buffer for deep links that arrive before the host is ready.
//!
//! The queue carries a one-shot gate: the first [`DeepLinkQueue::drain`]
//! closes it, after which nothing more is buffered. Only
//! [`DeepLinkQueue::reset`] opens it again.

use std::collections::VecDeque;

use super::{DeepLinkEntry, Intent};
use crate::shell::desktop::runtime::diagnostics::{
    CHANNEL_QUEUE_DRAINED, CHANNEL_QUEUE_ENQUEUE_IGNORED, DiagnosticEvent, emit_event,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum QueueGate {
    #[default]
    Open,
    Closed,
}

impl QueueGate {
    /// Open -> Closed. Returns whether this call performed the transition.
    fn close(&mut self) -> bool {
        match self {
            Self::Open => {
                *self = Self::Closed;
                true
            }
            Self::Closed => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct DeepLinkQueue {
    entries: VecDeque<DeepLinkEntry>,
    gate: QueueGate,
}

impl DeepLinkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Ignored once the queue has been drained.
    pub fn enqueue(&mut self, url: impl Into<String>, intent: Intent) -> bool {
        let url = url.into();
        if self.is_processed() {
            log::debug!("deep link queue already processed; ignoring {url} ({intent})");
            emit_event(DiagnosticEvent::MessageSent {
                channel_id: CHANNEL_QUEUE_ENQUEUE_IGNORED,
                byte_len: url.len(),
            });
            return false;
        }

        self.entries.push_back(DeepLinkEntry { url, intent });
        true
    }

    /// Closes the queue and hands back everything buffered so far, oldest
    /// first. Every later call before a [`reset`](Self::reset) yields nothing.
    pub fn drain(&mut self) -> Vec<DeepLinkEntry> {
        if !self.gate.close() {
            return Vec::new();
        }

        let drained: Vec<DeepLinkEntry> = self.entries.drain(..).collect();
        log::info!("deep link queue drained with {} pending entries", drained.len());
        emit_event(DiagnosticEvent::MessageSent {
            channel_id: CHANNEL_QUEUE_DRAINED,
            byte_len: drained.len(),
        });
        drained
    }

    /// Snapshot of the buffered entries.
    pub fn peek(&self) -> Vec<DeepLinkEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Drops buffered entries without closing the queue.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.gate = QueueGate::Open;
    }

    pub fn is_processed(&self) -> bool {
        self.gate == QueueGate::Closed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_items(&self) -> bool {
        !self.is_empty()
    }
}
