/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! One-time startup wiring: installer events, the instance lock, protocol
//! registration and the launch-argument scan, in that order.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::deeplink::Intent;
use crate::deeplink::dispatch::{DeepLinkConsumer, DispatchOutcome, DispatchPipeline, PendingReport};
use crate::deeplink::scheduler::Scheduler;
use crate::platform::registrar::{
    ProtocolRegistrar, RegistrationReport, SessionRegistrar, register_all, unregister_all,
};
use crate::platform::{PlatformKind, PlatformStrategy, StartupEvent};
use crate::registries::atomic::protocol::ProtocolSet;
use crate::shell::desktop::lifecycle::instance_lock::{
    InstanceLock, LoopbackInstanceLock, SecondLaunch,
};
use crate::shell::desktop::runtime::config::DeepLinkConfig;
use crate::shell::desktop::runtime::diagnostics::{
    CHANNEL_INSTANCE_LOCK_DENIED, CHANNEL_STARTUP_LIFECYCLE_EVENT, DiagnosticEvent, emit_event,
};

pub struct DeepLinkSetup {
    protocols: ProtocolSet,
    consumer: Arc<dyn DeepLinkConsumer>,
    scheduler: Arc<dyn Scheduler>,
    platform: &'static dyn PlatformStrategy,
    argv: Vec<String>,
    instance_lock: Option<Box<dyn InstanceLock>>,
    registrar: Box<dyn ProtocolRegistrar>,
    on_denied: Option<Box<dyn FnOnce() + Send>>,
}

impl DeepLinkSetup {
    /// Defaults: the running platform's strategy, this process's arguments,
    /// no instance lock and a [`SessionRegistrar`].
    pub fn new(
        protocols: ProtocolSet,
        consumer: Arc<dyn DeepLinkConsumer>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            protocols,
            consumer,
            scheduler,
            platform: PlatformKind::current().strategy(),
            argv: std::env::args().collect(),
            instance_lock: None,
            registrar: Box::new(SessionRegistrar::new()),
            on_denied: None,
        }
    }

    /// Protocols and a [`LoopbackInstanceLock`] on the configured port.
    pub fn from_config(
        config: &DeepLinkConfig,
        consumer: Arc<dyn DeepLinkConsumer>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self::new(config.protocol_set(), consumer, scheduler).instance_lock(
            LoopbackInstanceLock::new(config.instance_port(), SecondLaunch::from_env()),
        )
    }

    pub fn platform(mut self, platform: &'static dyn PlatformStrategy) -> Self {
        self.platform = platform;
        self
    }

    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn instance_lock(mut self, lock: impl InstanceLock + 'static) -> Self {
        self.instance_lock = Some(Box::new(lock));
        self
    }

    pub fn registrar(mut self, registrar: impl ProtocolRegistrar + 'static) -> Self {
        self.registrar = Box::new(registrar);
        self
    }

    /// Invoked once when another instance already holds the lock.
    pub fn on_instance_denied(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_denied = Some(Box::new(callback));
        self
    }

    pub fn run(self) -> DeepLinkHandle {
        let Self {
            protocols,
            consumer,
            scheduler,
            platform,
            argv,
            mut instance_lock,
            mut registrar,
            on_denied,
        } = self;

        if let Some(event) = platform.detect_startup_event(&argv) {
            log::info!(
                "startup lifecycle event {} detected; skipping instance lock",
                event.as_arg()
            );
            emit_event(DiagnosticEvent::MessageSent {
                channel_id: CHANNEL_STARTUP_LIFECYCLE_EVENT,
                byte_len: event.as_arg().len(),
            });
            return DeepLinkHandle::terminating(Some(event));
        }

        if let Some(lock) = instance_lock.as_mut() {
            if !lock.acquire() {
                log::info!("another instance is already running; this instance will exit");
                emit_event(DiagnosticEvent::MessageSent {
                    channel_id: CHANNEL_INSTANCE_LOCK_DENIED,
                    byte_len: 0,
                });
                if let Some(callback) = on_denied {
                    callback();
                }
                return DeepLinkHandle::terminating(None);
            }
        }

        let registrations = register_all(registrar.as_mut(), &protocols);
        let pipeline = Arc::new(DispatchPipeline::new(protocols, consumer, scheduler));

        // Launch arguments are queued before the relay listener exists, so
        // they always precede any second-launch link.
        if let Some(url) = platform.extract_deep_link(&argv, pipeline.protocols()) {
            pipeline.queue_deep_link(&url, Intent::Launch);
        }

        if let Some(lock) = instance_lock.as_mut() {
            let relay_pipeline = Arc::clone(&pipeline);
            lock.on_second_launch(Box::new(move |launch| {
                relay_second_launch(&relay_pipeline, platform, launch);
            }));
        }

        DeepLinkHandle {
            should_quit: false,
            startup_event: None,
            registrations,
            live: Some(LiveInstance {
                pipeline,
                registrar: Mutex::new(registrar),
                _instance_lock: Mutex::new(instance_lock),
            }),
        }
    }
}

fn relay_second_launch(
    pipeline: &Arc<DispatchPipeline>,
    platform: &dyn PlatformStrategy,
    launch: SecondLaunch,
) {
    log::info!(
        "second launch attempt from {} with {} arguments",
        launch.working_directory.display(),
        launch.argv.len()
    );
    match platform.extract_deep_link(&launch.argv, pipeline.protocols()) {
        Some(url) => {
            pipeline.queue_deep_link(&url, Intent::RuntimeOpen);
        }
        None => log::debug!("second launch carried no deep link"),
    }
}

struct LiveInstance {
    pipeline: Arc<DispatchPipeline>,
    registrar: Mutex<Box<dyn ProtocolRegistrar>>,
    // Held so the lock (and its relay) lives as long as the handle.
    _instance_lock: Mutex<Option<Box<dyn InstanceLock>>>,
}

/// What the host keeps after [`DeepLinkSetup::run`].
///
/// A terminating handle (installer event, or lock denied) has no pipeline;
/// its operations are inert.
pub struct DeepLinkHandle {
    should_quit: bool,
    startup_event: Option<StartupEvent>,
    registrations: Vec<RegistrationReport>,
    live: Option<LiveInstance>,
}

impl DeepLinkHandle {
    fn terminating(startup_event: Option<StartupEvent>) -> Self {
        Self {
            should_quit: true,
            startup_event,
            registrations: Vec::new(),
            live: None,
        }
    }

    /// This instance must exit without starting the application.
    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    pub fn startup_event(&self) -> Option<StartupEvent> {
        self.startup_event
    }

    pub fn registrations(&self) -> &[RegistrationReport] {
        &self.registrations
    }

    pub fn pipeline(&self) -> Option<&Arc<DispatchPipeline>> {
        self.live.as_ref().map(|live| &live.pipeline)
    }

    /// The host's "ready" signal.
    pub async fn process_pending_deep_links(&self) -> PendingReport {
        match self.pipeline() {
            Some(pipeline) => pipeline.process_pending().await,
            None => PendingReport::default(),
        }
    }

    pub fn pending_deep_links(&self) -> Vec<String> {
        self.pipeline()
            .map(|pipeline| pipeline.pending().into_iter().map(|entry| entry.url).collect())
            .unwrap_or_default()
    }

    pub fn clear_pending_deep_links(&self) {
        if let Some(pipeline) = self.pipeline() {
            pipeline.clear_pending();
        }
    }

    /// Without an explicit intent, `Launch` before readiness and
    /// `RuntimeOpen` after.
    pub fn queue_deep_link(&self, url: &str, intent: Option<Intent>) -> Option<DispatchOutcome> {
        let pipeline = self.pipeline()?;
        let intent = intent.unwrap_or_else(|| pipeline.default_intent());
        Some(pipeline.queue_deep_link(url, intent))
    }

    /// Native open-url callback (macOS `open-url`).
    pub async fn handle_open_url(&self, url: &str) -> Option<DispatchOutcome> {
        let pipeline = self.pipeline()?;
        Some(pipeline.handle(url, pipeline.default_intent()).await)
    }

    /// OS side only; the in-process protocol set stays as configured.
    pub fn unregister_protocols(&self) -> Vec<RegistrationReport> {
        match &self.live {
            Some(live) => unregister_all(live.registrar.lock().as_mut(), live.pipeline.protocols()),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for DeepLinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepLinkHandle")
            .field("should_quit", &self.should_quit)
            .field("startup_event", &self.startup_event)
            .field("registrations", &self.registrations)
            .finish_non_exhaustive()
    }
}
