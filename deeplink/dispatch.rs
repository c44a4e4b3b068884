/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Decides, for each incoming deep link, whether to drop it, defer it or
//! hand it to the application's consumer.
//!
//! Until [`DispatchPipeline::process_pending`] runs, every accepted link is
//! buffered in the [`DeepLinkQueue`]. That call drains the queue through the
//! consumer in arrival order and closes it, so from then on accepted links
//! go straight to the consumer.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;

use super::queue::DeepLinkQueue;
use super::scheduler::Scheduler;
use super::url::{ParsedUrl, parse};
use super::{DeepLinkEntry, Intent};
use crate::registries::atomic::protocol::ProtocolSet;
use crate::shell::desktop::runtime::diagnostics::{
    CHANNEL_DISPATCH_CONSUMER_FAILED, CHANNEL_DISPATCH_DELIVERED,
    CHANNEL_DISPATCH_DROPPED_MALFORMED, CHANNEL_DISPATCH_DROPPED_UNREGISTERED,
    CHANNEL_DISPATCH_QUEUED, DiagnosticEvent, emit_event,
};

pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

/// What the consumer learns about a delivered link besides its raw URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeepLinkContext {
    pub url: ParsedUrl,
    pub intent: Intent,
}

/// Application logic that receives deep links.
///
/// Failures, including panics, are reported and swallowed at the dispatch
/// boundary.
pub trait DeepLinkConsumer: Send + Sync {
    fn consume(
        &self,
        url: String,
        context: DeepLinkContext,
    ) -> BoxFuture<'static, Result<(), ConsumerError>>;
}

impl<F, Fut> DeepLinkConsumer for F
where
    F: Fn(String, DeepLinkContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ConsumerError>> + Send + 'static,
{
    fn consume(
        &self,
        url: String,
        context: DeepLinkContext,
    ) -> BoxFuture<'static, Result<(), ConsumerError>> {
        self(url, context).boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    UnregisteredScheme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dropped(DropReason),
    Queued,
    Dispatched,
    ConsumerFailed,
    /// Accepted; delivery runs on a later scheduler turn.
    Scheduled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingReport {
    pub drained: usize,
    pub delivered: usize,
    pub failed: usize,
}

enum Route {
    Done(DispatchOutcome),
    Deliver(ParsedUrl, Intent),
}

pub struct DispatchPipeline {
    protocols: ProtocolSet,
    queue: Mutex<DeepLinkQueue>,
    consumer: Arc<dyn DeepLinkConsumer>,
    scheduler: Arc<dyn Scheduler>,
}

impl DispatchPipeline {
    pub fn new(
        protocols: ProtocolSet,
        consumer: Arc<dyn DeepLinkConsumer>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            protocols,
            queue: Mutex::new(DeepLinkQueue::new()),
            consumer,
            scheduler,
        }
    }

    pub fn protocols(&self) -> &ProtocolSet {
        &self.protocols
    }

    pub fn is_processed(&self) -> bool {
        self.queue.lock().is_processed()
    }

    pub fn pending(&self) -> Vec<DeepLinkEntry> {
        self.queue.lock().peek()
    }

    pub fn clear_pending(&self) {
        self.queue.lock().clear();
    }

    /// Reopens the queue. Only for re-arming a pipeline in tests or
    /// re-entrant embeddings.
    pub fn reset(&self) {
        self.queue.lock().reset();
    }

    /// `Launch` while links are still being deferred, `RuntimeOpen` after.
    pub fn default_intent(&self) -> Intent {
        if self.is_processed() {
            Intent::RuntimeOpen
        } else {
            Intent::Launch
        }
    }

    pub async fn handle(&self, url: &str, intent: Intent) -> DispatchOutcome {
        match self.route(url, intent) {
            Route::Done(outcome) => outcome,
            Route::Deliver(parsed, intent) => self.deliver(parsed, intent).await,
        }
    }

    /// Like [`handle`](Self::handle), except that once the queue is closed
    /// delivery is pushed to the next scheduler turn instead of running
    /// inside the caller's stack.
    pub fn queue_deep_link(self: &Arc<Self>, url: &str, intent: Intent) -> DispatchOutcome {
        match self.route(url, intent) {
            Route::Done(outcome) => outcome,
            Route::Deliver(parsed, intent) => {
                let pipeline = Arc::clone(self);
                self.scheduler.schedule(
                    async move {
                        pipeline.deliver(parsed, intent).await;
                    }
                    .boxed(),
                );
                DispatchOutcome::Scheduled
            }
        }
    }

    /// Drains the queue through the consumer, one entry at a time, and closes
    /// it. Calls after the first find nothing to drain.
    pub async fn process_pending(&self) -> PendingReport {
        let entries = self.queue.lock().drain();
        let mut report = PendingReport {
            drained: entries.len(),
            ..PendingReport::default()
        };

        for entry in entries {
            let outcome = match parse(&entry.url) {
                Ok(parsed) => self.deliver(parsed, entry.intent).await,
                Err(error) => {
                    log::error!("queued deep link {:?} no longer parses: {error}", entry.url);
                    DispatchOutcome::Dropped(DropReason::Malformed)
                }
            };
            match outcome {
                DispatchOutcome::Dispatched => report.delivered += 1,
                _ => report.failed += 1,
            }
        }
        report
    }

    fn route(&self, url: &str, intent: Intent) -> Route {
        let parsed = match parse(url) {
            Ok(parsed) => parsed,
            Err(error) => {
                log::error!("dropping malformed deep link {url:?}: {error}");
                emit_event(DiagnosticEvent::MessageSent {
                    channel_id: CHANNEL_DISPATCH_DROPPED_MALFORMED,
                    byte_len: url.len(),
                });
                return Route::Done(DispatchOutcome::Dropped(DropReason::Malformed));
            }
        };

        if !self.protocols.contains(&parsed.scheme) {
            log::debug!("ignoring deep link for unregistered scheme {}", parsed.scheme);
            emit_event(DiagnosticEvent::MessageSent {
                channel_id: CHANNEL_DISPATCH_DROPPED_UNREGISTERED,
                byte_len: url.len(),
            });
            return Route::Done(DispatchOutcome::Dropped(DropReason::UnregisteredScheme));
        }

        let mut queue = self.queue.lock();
        if queue.is_processed() {
            return Route::Deliver(parsed, intent);
        }

        queue.enqueue(url, intent);
        log::info!("deferring deep link {url} ({intent}) until the application is ready");
        emit_event(DiagnosticEvent::MessageSent {
            channel_id: CHANNEL_DISPATCH_QUEUED,
            byte_len: url.len(),
        });
        Route::Done(DispatchOutcome::Queued)
    }

    async fn deliver(&self, parsed: ParsedUrl, intent: Intent) -> DispatchOutcome {
        let url = parsed.raw.clone();
        let context = DeepLinkContext {
            url: parsed,
            intent,
        };
        let started = Instant::now();

        let consumer = &self.consumer;
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            consumer.consume(url.clone(), context)
        })) {
            Ok(pending) => AssertUnwindSafe(pending)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_message(panic).into())),
            Err(panic) => Err(panic_message(panic).into()),
        };

        match result {
            Ok(()) => {
                log::debug!("delivered deep link {url} ({intent})");
                emit_event(DiagnosticEvent::MessageReceived {
                    channel_id: CHANNEL_DISPATCH_DELIVERED,
                    latency_us: saturating_micros(started.elapsed()),
                });
                DispatchOutcome::Dispatched
            }
            Err(error) => {
                log::error!("deep link consumer failed for {url}: {error}");
                emit_event(DiagnosticEvent::MessageSent {
                    channel_id: CHANNEL_DISPATCH_CONSUMER_FAILED,
                    byte_len: url.len(),
                });
                DispatchOutcome::ConsumerFailed
            }
        }
    }
}

impl std::fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("protocols", &self.protocols)
            .field("queue", &*self.queue.lock())
            .finish_non_exhaustive()
    }
}

fn saturating_micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("consumer panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("consumer panicked: {message}")
    } else {
        "consumer panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deeplink::scheduler::ManualScheduler;
    use crate::shell::desktop::runtime::diagnostics::{CHANNEL_QUEUE_DRAINED, DiagnosticsState};

    #[test]
    fn latency_saturates_instead_of_wrapping() {
        assert_eq!(saturating_micros(Duration::from_millis(3)), 3_000);
        assert_eq!(saturating_micros(Duration::MAX), u64::MAX);
    }

    #[derive(Default)]
    struct RecordingConsumer {
        calls: Mutex<Vec<(String, Intent)>>,
        fail_on: Option<&'static str>,
        panic_on: Option<&'static str>,
    }

    impl RecordingConsumer {
        fn calls(&self) -> Vec<(String, Intent)> {
            self.calls.lock().clone()
        }
    }

    impl DeepLinkConsumer for RecordingConsumer {
        fn consume(
            &self,
            url: String,
            context: DeepLinkContext,
        ) -> BoxFuture<'static, Result<(), ConsumerError>> {
            assert_eq!(context.url.raw, url);
            self.calls.lock().push((url.clone(), context.intent));
            if self.panic_on == Some(url.as_str()) {
                panic!("consumer blew up on {url}");
            }
            let fail = self.fail_on == Some(url.as_str());
            async move {
                if fail {
                    return Err(format!("rejected {url}").into());
                }
                Ok(())
            }
            .boxed()
        }
    }

    fn pipeline_with(
        consumer: Arc<RecordingConsumer>,
        scheduler: Arc<ManualScheduler>,
    ) -> Arc<DispatchPipeline> {
        Arc::new(DispatchPipeline::new(
            ProtocolSet::new(["myapp"]),
            consumer,
            scheduler,
        ))
    }

    fn fixture() -> (Arc<DispatchPipeline>, Arc<RecordingConsumer>, Arc<ManualScheduler>) {
        let consumer = Arc::new(RecordingConsumer::default());
        let scheduler = Arc::new(ManualScheduler::new());
        (
            pipeline_with(consumer.clone(), scheduler.clone()),
            consumer,
            scheduler,
        )
    }

    #[tokio::test]
    async fn unregistered_scheme_is_silently_dropped() {
        let (pipeline, consumer, _) = fixture();

        let outcome = pipeline.handle("other://x", Intent::Launch).await;

        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::UnregisteredScheme));
        assert!(consumer.calls().is_empty());
        assert!(pipeline.pending().is_empty());

        pipeline.process_pending().await;
        assert_eq!(
            pipeline.handle("other://x", Intent::RuntimeOpen).await,
            DispatchOutcome::Dropped(DropReason::UnregisteredScheme)
        );
        assert!(consumer.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_url_is_dropped_without_touching_the_queue() {
        let (pipeline, consumer, _) = fixture();

        assert_eq!(
            pipeline.handle("not a url", Intent::Launch).await,
            DispatchOutcome::Dropped(DropReason::Malformed)
        );
        assert_eq!(pipeline.handle("myapp://ok", Intent::Launch).await, DispatchOutcome::Queued);
        assert_eq!(pipeline.pending(), vec![DeepLinkEntry::new("myapp://ok", Intent::Launch)]);
        assert!(consumer.calls().is_empty());
    }

    #[tokio::test]
    async fn links_wait_for_process_pending_and_drain_in_order() {
        let (pipeline, consumer, _) = fixture();

        for url in ["myapp://first", "myapp://second", "myapp://third"] {
            assert_eq!(pipeline.handle(url, Intent::Launch).await, DispatchOutcome::Queued);
        }
        pipeline.handle("myapp://fourth", Intent::RuntimeOpen).await;
        assert!(consumer.calls().is_empty());

        let report = pipeline.process_pending().await;

        assert_eq!(
            report,
            PendingReport {
                drained: 4,
                delivered: 4,
                failed: 0
            }
        );
        assert_eq!(
            consumer.calls(),
            vec![
                ("myapp://first".to_string(), Intent::Launch),
                ("myapp://second".to_string(), Intent::Launch),
                ("myapp://third".to_string(), Intent::Launch),
                ("myapp://fourth".to_string(), Intent::RuntimeOpen),
            ]
        );
        assert!(pipeline.is_processed());
    }

    #[tokio::test]
    async fn handle_passes_through_after_processing() {
        let (pipeline, consumer, _) = fixture();
        pipeline.process_pending().await;

        let outcome = pipeline.handle("myapp://live", Intent::RuntimeOpen).await;

        assert_eq!(outcome, DispatchOutcome::Dispatched);
        assert_eq!(consumer.calls(), vec![("myapp://live".to_string(), Intent::RuntimeOpen)]);
        assert!(pipeline.pending().is_empty());
    }

    #[tokio::test]
    async fn process_pending_only_drains_once() {
        let (pipeline, consumer, _) = fixture();
        pipeline.handle("myapp://a", Intent::Launch).await;

        assert_eq!(pipeline.process_pending().await.delivered, 1);
        assert_eq!(pipeline.process_pending().await, PendingReport::default());
        assert_eq!(consumer.calls().len(), 1);
    }

    #[tokio::test]
    async fn consumer_failure_does_not_stop_draining() {
        let consumer = Arc::new(RecordingConsumer {
            fail_on: Some("myapp://second"),
            ..RecordingConsumer::default()
        });
        let pipeline = pipeline_with(consumer.clone(), Arc::new(ManualScheduler::new()));

        for url in ["myapp://first", "myapp://second", "myapp://third"] {
            pipeline.handle(url, Intent::Launch).await;
        }
        let report = pipeline.process_pending().await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(consumer.calls().len(), 3);
        assert_eq!(
            pipeline.handle("myapp://second", Intent::RuntimeOpen).await,
            DispatchOutcome::ConsumerFailed
        );
    }

    #[tokio::test]
    async fn consumer_panic_is_contained() {
        let consumer = Arc::new(RecordingConsumer {
            panic_on: Some("myapp://boom"),
            ..RecordingConsumer::default()
        });
        let pipeline = pipeline_with(consumer.clone(), Arc::new(ManualScheduler::new()));

        pipeline.handle("myapp://boom", Intent::Launch).await;
        pipeline.handle("myapp://after", Intent::Launch).await;
        let report = pipeline.process_pending().await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(consumer.calls().last().map(|(url, _)| url.as_str()), Some("myapp://after"));
    }

    #[tokio::test]
    async fn closure_consumers_are_accepted() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = move |url: String, context: DeepLinkContext| {
            let sink = sink.clone();
            async move {
                sink.lock().push((url, context.url.host));
                Ok::<(), ConsumerError>(())
            }
        };
        let pipeline = DispatchPipeline::new(
            ProtocolSet::new(["myapp"]),
            Arc::new(consumer),
            Arc::new(ManualScheduler::new()),
        );

        pipeline.process_pending().await;
        pipeline.handle("myapp://auth/callback", Intent::RuntimeOpen).await;

        assert_eq!(
            *seen.lock(),
            vec![("myapp://auth/callback".to_string(), "auth".to_string())]
        );
    }

    #[tokio::test]
    async fn queue_deep_link_before_ready_behaves_like_handle() {
        let (pipeline, consumer, scheduler) = fixture();

        assert_eq!(pipeline.queue_deep_link("myapp://early", Intent::Launch), DispatchOutcome::Queued);
        assert_eq!(
            pipeline.queue_deep_link("other://early", Intent::Launch),
            DispatchOutcome::Dropped(DropReason::UnregisteredScheme)
        );
        assert_eq!(scheduler.pending_tasks(), 0);
        assert_eq!(pipeline.pending().len(), 1);
        assert!(consumer.calls().is_empty());
    }

    #[tokio::test]
    async fn queue_deep_link_after_ready_defers_to_next_turn() {
        let (pipeline, consumer, scheduler) = fixture();
        pipeline.process_pending().await;

        let outcome = pipeline.queue_deep_link("myapp://later", Intent::RuntimeOpen);

        assert_eq!(outcome, DispatchOutcome::Scheduled);
        assert!(consumer.calls().is_empty(), "delivery must not run inside the caller");
        assert!(pipeline.pending().is_empty(), "a closed queue is never reopened");

        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(consumer.calls(), vec![("myapp://later".to_string(), Intent::RuntimeOpen)]);
    }

    #[tokio::test]
    async fn default_intent_tracks_queue_state() {
        let (pipeline, _, _) = fixture();
        assert_eq!(pipeline.default_intent(), Intent::Launch);
        pipeline.process_pending().await;
        assert_eq!(pipeline.default_intent(), Intent::RuntimeOpen);
    }

    #[tokio::test]
    async fn clear_pending_keeps_deferring_and_reset_rearms() {
        let (pipeline, consumer, _) = fixture();
        pipeline.handle("myapp://dropped", Intent::Launch).await;
        pipeline.clear_pending();
        assert!(!pipeline.is_processed());

        pipeline.handle("myapp://kept", Intent::Launch).await;
        pipeline.process_pending().await;
        assert_eq!(consumer.calls(), vec![("myapp://kept".to_string(), Intent::Launch)]);

        pipeline.reset();
        assert_eq!(pipeline.handle("myapp://again", Intent::Launch).await, DispatchOutcome::Queued);
    }

    #[tokio::test]
    async fn dispatch_emits_diagnostics_channels() {
        let mut diagnostics = DiagnosticsState::new();
        let (pipeline, _, _) = fixture();

        pipeline.handle("myapp://a", Intent::Launch).await;
        pipeline.handle("bogus", Intent::Launch).await;
        pipeline.handle("other://a", Intent::Launch).await;
        pipeline.process_pending().await;

        diagnostics.tick_drain();
        assert_eq!(diagnostics.channel_count(CHANNEL_DISPATCH_QUEUED), 1);
        assert_eq!(diagnostics.channel_count(CHANNEL_DISPATCH_DROPPED_MALFORMED), 1);
        assert_eq!(diagnostics.channel_count(CHANNEL_DISPATCH_DROPPED_UNREGISTERED), 1);
        assert_eq!(diagnostics.channel_count(CHANNEL_QUEUE_DRAINED), 1);
        assert_eq!(diagnostics.channel_count(CHANNEL_DISPATCH_DELIVERED), 1);
    }
}
