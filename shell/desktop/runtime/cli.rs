/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{env, panic};

use bpaf::Bpaf;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::warn;

use crate::deeplink::dispatch::{ConsumerError, DeepLinkConsumer, DeepLinkContext};
use crate::deeplink::scheduler::TokioScheduler;
use crate::shell::desktop::lifecycle::startup::DeepLinkSetup;
use crate::shell::desktop::runtime::config::DeepLinkConfig;
use crate::shell::desktop::runtime::diagnostics::{CHANNEL_DISPATCH_DELIVERED, DiagnosticsState};

/// Options that take a value, either as the next argument or after `=`.
const VALUE_FLAGS: [&str; 4] = ["--config", "--protocol", "--ready-delay-ms", "--log-filter"];
const BARE_FLAGS: [&str; 4] = ["--help", "-h", "--version", "-V"];

#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version(crate::VERSION))]
struct CliOptions {
    /// Config file (defaults to the platform config dir)
    #[bpaf(long, argument("PATH"))]
    config: Option<PathBuf>,

    /// Accept deep links for SCHEME; may be repeated
    #[bpaf(long("protocol"), argument("SCHEME"))]
    protocols: Vec<String>,

    /// Delay before signalling readiness
    #[bpaf(long, argument("MS"))]
    ready_delay_ms: Option<u64>,

    /// Log filter, e.g. `deeplink_shell=debug`
    #[bpaf(long, argument("FILTER"))]
    log_filter: Option<String>,

    /// Launch arguments; deep links among them are picked up
    #[bpaf(positional("ARG"))]
    args: Vec<String>,
}

/// Consumer used by the standalone binary: logs every delivered link.
struct LoggingConsumer;

impl DeepLinkConsumer for LoggingConsumer {
    fn consume(
        &self,
        url: String,
        context: DeepLinkContext,
    ) -> BoxFuture<'static, Result<(), ConsumerError>> {
        let query: Vec<String> = context
            .url
            .query
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        log::info!(
            "deep link {url} ({}) host={} path={} query=[{}]",
            context.intent,
            context.url.host,
            context.url.path,
            query.join(", ")
        );
        async { Ok(()) }.boxed()
    }
}

/// Separates flags this binary knows from flags added by installers or the
/// OS (`--squirrel-firstrun`, `-psn_0_42`). Foreign flags are returned
/// separately; everything else, including bare deep links, goes to bpaf.
fn split_foreign_flags(args: &[String]) -> (Vec<String>, Vec<String>) {
    let mut ours = Vec::new();
    let mut foreign = Vec::new();
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        if arg == "--" {
            ours.push(arg.clone());
            ours.extend(args.by_ref().cloned());
            break;
        }

        let name = arg.split_once('=').map_or(arg.as_str(), |(name, _)| name);
        if VALUE_FLAGS.contains(&name) {
            ours.push(arg.clone());
            if name == arg {
                ours.extend(args.next().cloned());
            }
        } else if BARE_FLAGS.contains(&arg.as_str()) || !arg.starts_with('-') || arg == "-" {
            ours.push(arg.clone());
        } else {
            foreign.push(arg.clone());
        }
    }
    (ours, foreign)
}

fn parse_launch_args(args: &[String]) -> Result<(CliOptions, Vec<String>), bpaf::ParseFailure> {
    let (ours, foreign) = split_foreign_flags(args);
    let opts = cli_options().run_inner(ours.as_slice())?;
    Ok((opts, foreign))
}

pub fn main() {
    // Setup scans the raw arguments for installer events and deep links;
    // foreign flags are set aside rather than rejected.
    let raw_args: Vec<String> = env::args().collect();
    let (opts, foreign) = match parse_launch_args(raw_args.get(1..).unwrap_or_default()) {
        Ok(parsed) => parsed,
        Err(failure) => {
            failure.print_message(100);
            std::process::exit(failure.exit_code())
        }
    };

    let mut config = match DeepLinkConfig::load(opts.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
    };
    apply_cli_overrides(&mut config, &opts);

    crate::init_tracing(config.log_filter.as_deref());
    if !foreign.is_empty() {
        log::debug!("ignoring launch flags not handled here: {}", foreign.join(" "));
    }
    panic::set_hook(Box::new(|info| log::error!("panic: {info}")));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            log::error!("could not start async runtime: {error}");
            terminate_with_exit_code(1);
        }
    };

    let exit_code = runtime.block_on(run(config, raw_args));
    if exit_code != 0 {
        terminate_with_exit_code(exit_code);
    }
}

async fn run(config: DeepLinkConfig, raw_args: Vec<String>) -> i32 {
    let mut diagnostics = DiagnosticsState::new();
    let scheduler = Arc::new(TokioScheduler::new(tokio::runtime::Handle::current()));

    if config.protocols.is_empty() {
        warn!("no protocols configured; every deep link will be ignored");
    }

    let handle = DeepLinkSetup::from_config(&config, Arc::new(LoggingConsumer), scheduler)
        .argv(raw_args)
        .run();

    if handle.should_quit() {
        match handle.startup_event() {
            Some(event) => log::info!("handled {}; exiting", event.as_arg()),
            None => log::info!("another instance is running; exiting"),
        }
        return 0;
    }

    if config.ready_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.ready_delay_ms)).await;
    }
    let report = handle.process_pending_deep_links().await;
    log::info!(
        "ready: {} pending deep links, {} delivered, {} failed",
        report.drained,
        report.delivered,
        report.failed
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    log::error!("could not listen for shutdown signal: {error}");
                }
                break;
            }
            _ = ticker.tick() => {
                diagnostics.tick_drain();
            }
        }
    }

    diagnostics.tick_drain();
    log::info!(
        "shutting down after {} deep link deliveries",
        diagnostics.channel_count(CHANNEL_DISPATCH_DELIVERED)
    );
    handle.unregister_protocols();
    0
}

fn apply_cli_overrides(config: &mut DeepLinkConfig, opts: &CliOptions) {
    if !opts.protocols.is_empty() {
        config.protocols = opts.protocols.clone();
    }
    if let Some(delay) = opts.ready_delay_ms {
        config.ready_delay_ms = delay;
    }
    if let Some(filter) = &opts.log_filter {
        config.log_filter = Some(filter.clone());
    }
    if !opts.args.is_empty() {
        log::debug!("{} launch arguments passed through", opts.args.len());
    }
}

fn terminate_with_exit_code(code: i32) -> ! {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::_exit(code)
    }

    #[cfg(not(target_os = "linux"))]
    {
        std::process::exit(code)
    }
}
