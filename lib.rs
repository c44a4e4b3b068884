/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Single-instance startup coordination and deep-link delivery.
//!
//! A desktop host calls [`DeepLinkSetup::run`] once during startup. The
//! returned [`DeepLinkHandle`] tells the host whether this process must
//! terminate, buffers deep links until the host signals readiness through
//! [`DeepLinkHandle::process_pending_deep_links`], and from then on delivers
//! each accepted link straight to the host's consumer.

pub mod deeplink;
pub mod platform;
pub mod registries;
pub mod shell;

pub use deeplink::dispatch::{
    ConsumerError, DeepLinkConsumer, DeepLinkContext, DispatchOutcome, DispatchPipeline,
    DropReason, PendingReport,
};
pub use deeplink::queue::DeepLinkQueue;
pub use deeplink::scheduler::{ManualScheduler, Scheduler, TokioScheduler};
pub use deeplink::url::{ParseError, ParsedUrl, QueryParams, parse, parse_deep_link};
pub use deeplink::{DeepLinkEntry, Intent};
pub use platform::registrar::{ProtocolRegistrar, RegistrationReport, SessionRegistrar};
pub use platform::{PlatformKind, PlatformStrategy, StartupEvent};
pub use registries::atomic::protocol::ProtocolSet;
pub use shell::desktop::lifecycle::instance_lock::{
    InstanceLock, LoopbackInstanceLock, SecondLaunch, SecondLaunchListener,
};
pub use shell::desktop::lifecycle::startup::{DeepLinkHandle, DeepLinkSetup};
pub use shell::desktop::runtime::config::{ConfigError, DeepLinkConfig};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Routes `log` records through a `tracing-subscriber` formatter.
///
/// `filter` uses `EnvFilter` syntax; without one, `RUST_LOG` applies and
/// falls back to `info`.
#[cfg(feature = "tracing")]
pub fn init_tracing(filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    if let Err(error) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("could not install log subscriber: {error}");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn init_tracing(filter: Option<&str>) {
    if filter.is_some() {
        eprintln!("log filter ignored: built without the `tracing` feature");
    }
}
