use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use deeplink_shell::platform::{LinuxStrategy, MacOsStrategy, WindowsStrategy};
use deeplink_shell::{
    ConsumerError, DeepLinkContext, DeepLinkSetup, DispatchOutcome, DropReason, InstanceLock,
    Intent, LoopbackInstanceLock, ManualScheduler, PendingReport, ProtocolRegistrar, ProtocolSet, SecondLaunch,
    SecondLaunchListener, StartupEvent, VERSION,
};
use parking_lot::Mutex;

type Calls = Arc<Mutex<Vec<(String, Intent)>>>;

fn recording_consumer(
    calls: &Calls,
) -> impl Fn(String, DeepLinkContext) -> std::future::Ready<Result<(), ConsumerError>>
+ Send
+ Sync
+ 'static {
    let calls = Arc::clone(calls);
    move |url: String, context: DeepLinkContext| {
        calls.lock().push((url, context.intent));
        std::future::ready(Ok(()))
    }
}

#[derive(Default, Clone)]
struct FakeLock {
    deny: bool,
    listener: Arc<Mutex<Option<SecondLaunchListener>>>,
}

impl FakeLock {
    fn relay(&self, argv: &[&str]) {
        if let Some(listener) = self.listener.lock().as_ref() {
            listener(SecondLaunch::new(argv.iter().copied(), "/"));
        }
    }
}

impl InstanceLock for FakeLock {
    fn acquire(&mut self) -> bool {
        !self.deny
    }

    fn on_second_launch(&mut self, listener: SecondLaunchListener) {
        *self.listener.lock() = Some(listener);
    }
}

#[derive(Default, Clone)]
struct SharedRegistrar {
    log: Arc<Mutex<Vec<String>>>,
}

impl ProtocolRegistrar for SharedRegistrar {
    fn register_scheme(&mut self, scheme: &str) -> bool {
        self.log.lock().push(format!("+{scheme}"));
        true
    }

    fn unregister_scheme(&mut self, scheme: &str) -> bool {
        self.log.lock().push(format!("-{scheme}"));
        true
    }
}

fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}

#[test]
fn scenarios_binary_smoke_runs() {
    assert!(!VERSION.is_empty());
}

#[tokio::test]
async fn cold_start_then_runtime_links() {
    let calls = Calls::default();
    let scheduler = Arc::new(ManualScheduler::new());
    let lock = FakeLock::default();
    let registrar = SharedRegistrar::default();

    let handle = DeepLinkSetup::new(
        ProtocolSet::new(["myapp", "other"]),
        Arc::new(recording_consumer(&calls)),
        scheduler.clone(),
    )
    .platform(&MacOsStrategy)
    .argv(["/Applications/App", "-psn_0_42", "myapp://boot?tab=2"])
    .instance_lock(lock.clone())
    .registrar(registrar.clone())
    .run();

    assert!(!handle.should_quit());
    assert_eq!(*registrar.log.lock(), ["+myapp", "+other"]);
    assert_eq!(
        handle.handle_open_url("other://cold").await,
        Some(DispatchOutcome::Queued)
    );
    assert!(calls.lock().is_empty());

    let report = handle.process_pending_deep_links().await;
    assert_eq!((report.drained, report.delivered, report.failed), (2, 2, 0));

    lock.relay(&["/Applications/App", "myapp://second"]);
    assert_eq!(scheduler.pending_tasks(), 1);
    assert_eq!(
        handle.queue_deep_link("other://explicit", Some(Intent::Launch)),
        Some(DispatchOutcome::Scheduled)
    );
    scheduler.run_pending();

    assert_eq!(
        *calls.lock(),
        [
            ("myapp://boot?tab=2".to_string(), Intent::Launch),
            ("other://cold".to_string(), Intent::Launch),
            ("myapp://second".to_string(), Intent::RuntimeOpen),
            ("other://explicit".to_string(), Intent::Launch),
        ]
    );

    assert_eq!(handle.process_pending_deep_links().await, PendingReport::default());

    handle.unregister_protocols();
    assert_eq!(
        *registrar.log.lock(),
        ["+myapp", "+other", "-myapp", "-other"]
    );
}

#[tokio::test]
async fn rejected_links_never_reach_the_consumer() {
    let calls = Calls::default();
    let handle = DeepLinkSetup::new(
        ProtocolSet::new(["myapp"]),
        Arc::new(recording_consumer(&calls)),
        Arc::new(ManualScheduler::new()),
    )
    .platform(&LinuxStrategy)
    .argv(["app"])
    .run();
    handle.process_pending_deep_links().await;

    assert_eq!(
        handle.handle_open_url("not a url").await,
        Some(DispatchOutcome::Dropped(DropReason::Malformed))
    );
    assert_eq!(
        handle.handle_open_url("https://example.com").await,
        Some(DispatchOutcome::Dropped(DropReason::UnregisteredScheme))
    );
    assert_eq!(
        handle.handle_open_url("MYAPP://Upper").await,
        Some(DispatchOutcome::Dispatched)
    );
    assert_eq!(*calls.lock(), [("MYAPP://Upper".to_string(), Intent::RuntimeOpen)]);
}

#[tokio::test]
async fn failing_consumer_does_not_stop_the_queue() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = {
        let seen = Arc::clone(&seen);
        move |url: String, _context: DeepLinkContext| {
            seen.lock().push(url.clone());
            async move {
                if url.contains("boom") {
                    return Err::<(), ConsumerError>("consumer refused".into());
                }
                if url.contains("panic") {
                    panic!("consumer panicked on {url}");
                }
                Ok(())
            }
        }
    };

    let handle = DeepLinkSetup::new(
        ProtocolSet::new(["myapp"]),
        Arc::new(consumer),
        Arc::new(ManualScheduler::new()),
    )
    .platform(&LinuxStrategy)
    .argv(["app"])
    .run();

    for url in ["myapp://boom", "myapp://panic", "myapp://fine"] {
        assert_eq!(handle.queue_deep_link(url, None), Some(DispatchOutcome::Queued));
    }
    let report = handle.process_pending_deep_links().await;

    assert_eq!((report.drained, report.delivered, report.failed), (3, 1, 2));
    assert_eq!(*seen.lock(), ["myapp://boom", "myapp://panic", "myapp://fine"]);
}

#[test]
fn installer_launch_exits_without_touching_the_lock() {
    let calls = Calls::default();
    let lock_requested = Arc::new(AtomicBool::new(false));

    struct TrackingLock(Arc<AtomicBool>);
    impl InstanceLock for TrackingLock {
        fn acquire(&mut self) -> bool {
            self.0.store(true, Ordering::SeqCst);
            true
        }
        fn on_second_launch(&mut self, _listener: SecondLaunchListener) {}
    }

    let handle = DeepLinkSetup::new(
        ProtocolSet::new(["myapp"]),
        Arc::new(recording_consumer(&calls)),
        Arc::new(ManualScheduler::new()),
    )
    .platform(&WindowsStrategy)
    .argv(["C:\\App\\app.exe", "--squirrel-uninstall"])
    .instance_lock(TrackingLock(lock_requested.clone()))
    .run();

    assert!(handle.should_quit());
    assert_eq!(handle.startup_event(), Some(StartupEvent::Uninstall));
    assert!(!lock_requested.load(Ordering::SeqCst));
    assert!(handle.registrations().is_empty());
}

#[test]
fn second_process_relays_its_link_over_loopback() {
    let port = free_port();
    let calls = Calls::default();
    let scheduler = Arc::new(ManualScheduler::new());

    let primary = DeepLinkSetup::new(
        ProtocolSet::new(["myapp"]),
        Arc::new(recording_consumer(&calls)),
        scheduler.clone(),
    )
    .platform(&WindowsStrategy)
    .argv(["app.exe"])
    .instance_lock(LoopbackInstanceLock::new(
        port,
        SecondLaunch::new(["app.exe"], "/"),
    ))
    .run();
    assert!(!primary.should_quit());
    pollster::block_on(primary.process_pending_deep_links());

    let denied = Arc::new(AtomicBool::new(false));
    let flag = denied.clone();
    let secondary = DeepLinkSetup::new(
        ProtocolSet::new(["myapp"]),
        Arc::new(recording_consumer(&Calls::default())),
        Arc::new(ManualScheduler::new()),
    )
    .platform(&WindowsStrategy)
    .argv(["app.exe"])
    .instance_lock(LoopbackInstanceLock::new(
        port,
        SecondLaunch::new(["app.exe", "myapp://from-second?x=1"], "C:\\work"),
    ))
    .on_instance_denied(move || flag.store(true, Ordering::SeqCst))
    .run();

    assert!(secondary.should_quit());
    assert!(denied.load(Ordering::SeqCst));

    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.pending_tasks() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    scheduler.run_pending();

    assert_eq!(
        *calls.lock(),
        [("myapp://from-second?x=1".to_string(), Intent::RuntimeOpen)]
    );
}
