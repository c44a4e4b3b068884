/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Channel-tagged diagnostic events for the deep-link path.
//!
//! Emission is fire-and-forget: with no sender installed every event is
//! discarded. Nothing here influences control flow.

use std::collections::HashMap;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::RwLock;

pub const CHANNEL_DISPATCH_QUEUED: &str = "deeplink.dispatch.queued";
pub const CHANNEL_DISPATCH_DELIVERED: &str = "deeplink.dispatch.delivered";
pub const CHANNEL_DISPATCH_DROPPED_MALFORMED: &str = "deeplink.dispatch.dropped_malformed";
pub const CHANNEL_DISPATCH_DROPPED_UNREGISTERED: &str = "deeplink.dispatch.dropped_unregistered";
pub const CHANNEL_DISPATCH_CONSUMER_FAILED: &str = "deeplink.dispatch.consumer_failed";
pub const CHANNEL_QUEUE_DRAINED: &str = "deeplink.queue.drained";
pub const CHANNEL_QUEUE_ENQUEUE_IGNORED: &str = "deeplink.queue.enqueue_ignored";
pub const CHANNEL_INSTANCE_LOCK_DENIED: &str = "deeplink.instance.lock_denied";
pub const CHANNEL_INSTANCE_SECOND_LAUNCH: &str = "deeplink.instance.second_launch";
pub const CHANNEL_STARTUP_LIFECYCLE_EVENT: &str = "deeplink.startup.lifecycle_event";

type SenderSlot = RwLock<Option<Sender<DiagnosticEvent>>>;

/// The most recently installed sender receives every event.
static GLOBAL_DIAGNOSTICS_TX: SenderSlot = RwLock::new(None);

#[cfg(test)]
thread_local! {
    static TEST_DIAGNOSTICS_TX: std::cell::RefCell<Option<Sender<DiagnosticEvent>>> =
        const { std::cell::RefCell::new(None) };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    MessageSent {
        channel_id: &'static str,
        byte_len: usize,
    },
    MessageReceived {
        channel_id: &'static str,
        latency_us: u64,
    },
}

impl DiagnosticEvent {
    fn channel_id(&self) -> &'static str {
        match self {
            Self::MessageSent { channel_id, .. } | Self::MessageReceived { channel_id, .. } => {
                channel_id
            }
        }
    }
}

/// Installs `sender` as the emission target, replacing any earlier one.
pub fn install_global_sender(sender: Sender<DiagnosticEvent>) {
    if replace_sender(&GLOBAL_DIAGNOSTICS_TX, sender.clone()) {
        log::debug!("diagnostics sender replaced; the previous aggregator receives no more events");
    }

    #[cfg(test)]
    {
        TEST_DIAGNOSTICS_TX.with(|slot| {
            *slot.borrow_mut() = Some(sender.clone());
        });
    }
}

/// Returns whether a sender was already installed.
fn replace_sender(slot: &SenderSlot, sender: Sender<DiagnosticEvent>) -> bool {
    slot.write().replace(sender).is_some()
}

pub(crate) fn emit_event(event: DiagnosticEvent) {
    // Unit tests run in parallel; only the emitting thread's own state sees
    // its events.
    #[cfg(test)]
    {
        TEST_DIAGNOSTICS_TX.with(|slot| {
            if let Some(tx) = slot.borrow().as_ref() {
                let _ = tx.send(event);
            }
        });
    }

    #[cfg(not(test))]
    {
        if let Some(tx) = GLOBAL_DIAGNOSTICS_TX.read().as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Aggregates drained events per channel.
pub struct DiagnosticsState {
    pub event_tx: Sender<DiagnosticEvent>,
    event_rx: Receiver<DiagnosticEvent>,
    message_counts: HashMap<&'static str, u64>,
    message_bytes_sent: HashMap<&'static str, u64>,
    message_latency_us: HashMap<&'static str, u64>,
}

impl DiagnosticsState {
    /// Creates the aggregator and installs its sender as the emission target.
    pub fn new() -> Self {
        let (event_tx, event_rx) = unbounded();
        install_global_sender(event_tx.clone());
        Self {
            event_tx,
            event_rx,
            message_counts: HashMap::new(),
            message_bytes_sent: HashMap::new(),
            message_latency_us: HashMap::new(),
        }
    }

    /// Folds every queued event into the per-channel totals.
    pub fn tick_drain(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            drained += 1;
            *self.message_counts.entry(event.channel_id()).or_default() += 1;
            match event {
                DiagnosticEvent::MessageSent {
                    channel_id,
                    byte_len,
                } => {
                    *self.message_bytes_sent.entry(channel_id).or_default() += byte_len as u64;
                }
                DiagnosticEvent::MessageReceived {
                    channel_id,
                    latency_us,
                } => {
                    *self.message_latency_us.entry(channel_id).or_default() += latency_us;
                }
            }
        }
        drained
    }

    pub fn channel_count(&self, channel_id: &str) -> u64 {
        self.message_counts.get(channel_id).copied().unwrap_or(0)
    }

    pub fn channel_bytes(&self, channel_id: &str) -> u64 {
        self.message_bytes_sent.get(channel_id).copied().unwrap_or(0)
    }

    pub fn channel_latency_us(&self, channel_id: &str) -> u64 {
        self.message_latency_us.get(channel_id).copied().unwrap_or(0)
    }
}

impl Default for DiagnosticsState {
    fn default() -> Self {
        Self::new()
    }
}
