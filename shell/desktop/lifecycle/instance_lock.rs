/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Single-instance lock and second-launch relay.

use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::shell::desktop::runtime::diagnostics::{
    CHANNEL_INSTANCE_SECOND_LAUNCH, DiagnosticEvent, emit_event,
};

const HANDOFF_ACK: &str = "ok";
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(1);
const HANDOFF_RETRY_MIN: Duration = Duration::from_millis(50);
const HANDOFF_RETRY_MAX: Duration = Duration::from_millis(400);
const HANDOFF_RETRIES: usize = 3;

fn handoff_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(HANDOFF_RETRY_MIN)
        .with_max_delay(HANDOFF_RETRY_MAX)
        .with_factor(2.0)
        .with_max_times(HANDOFF_RETRIES)
}

/// Launch arguments of a process that found the lock already held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondLaunch {
    pub argv: Vec<String>,
    pub working_directory: PathBuf,
}

impl SecondLaunch {
    pub fn new<I, S>(argv: I, working_directory: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            working_directory: working_directory.into(),
        }
    }

    pub fn from_env() -> Self {
        Self {
            argv: std::env::args().collect(),
            working_directory: std::env::current_dir().unwrap_or_default(),
        }
    }
}

pub type SecondLaunchListener = Box<dyn Fn(SecondLaunch) + Send + Sync>;

/// OS/runtime primitive granting "primary instance" status.
pub trait InstanceLock: Send {
    /// `true` when this process is now the only live instance.
    fn acquire(&mut self) -> bool;

    /// Called for every later launch attempt while the lock is held.
    fn on_second_launch(&mut self, listener: SecondLaunchListener);
}

#[derive(Debug)]
pub enum InstanceLockError {
    Io(std::io::Error),
    Encode(serde_json::Error),
    Decode(serde_json::Error),
    HandoffRejected(String),
}

impl std::fmt::Display for InstanceLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "instance relay io failed: {e}"),
            Self::Encode(e) => write!(f, "could not encode launch arguments: {e}"),
            Self::Decode(e) => write!(f, "could not decode launch arguments: {e}"),
            Self::HandoffRejected(reply) => {
                write!(f, "lock holder answered {reply:?} instead of acknowledging")
            }
        }
    }
}

impl std::error::Error for InstanceLockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) | Self::Decode(e) => Some(e),
            Self::HandoffRejected(_) => None,
        }
    }
}

impl From<std::io::Error> for InstanceLockError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

#[derive(Default)]
struct RelayState {
    listener: Option<SecondLaunchListener>,
    buffered: Vec<SecondLaunch>,
}

impl RelayState {
    fn relay(&mut self, launch: SecondLaunch) {
        emit_event(DiagnosticEvent::MessageSent {
            channel_id: CHANNEL_INSTANCE_SECOND_LAUNCH,
            byte_len: launch.argv.iter().map(String::len).sum(),
        });
        match &self.listener {
            Some(listener) => listener(launch),
            None => self.buffered.push(launch),
        }
    }
}

/// Lock held by listening on a fixed loopback port.
///
/// The holder accepts one JSON-encoded [`SecondLaunch`] line per connection
/// and answers `ok` once the launch has been relayed. Each connection is
/// served on its own thread, so an idle client never delays another launch.
/// A process that finds the port taken hands its own launch arguments to the
/// holder and reports the lock as denied, even when the hand-off fails.
pub struct LoopbackInstanceLock {
    port: u16,
    handoff: SecondLaunch,
    local_port: Option<u16>,
    relay: Arc<Mutex<RelayState>>,
}

impl LoopbackInstanceLock {
    pub fn new(port: u16, handoff: SecondLaunch) -> Self {
        Self {
            port,
            handoff,
            local_port: None,
            relay: Arc::new(Mutex::new(RelayState::default())),
        }
    }

    /// Bound port once the lock is held.
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    fn hand_off(&self) -> Result<(), InstanceLockError> {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port))?;
        stream.set_read_timeout(Some(HANDOFF_TIMEOUT))?;
        stream.set_write_timeout(Some(HANDOFF_TIMEOUT))?;

        let mut payload = serde_json::to_string(&self.handoff).map_err(InstanceLockError::Encode)?;
        payload.push('\n');
        stream.write_all(payload.as_bytes())?;
        stream.flush()?;

        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply)?;
        if reply.trim() != HANDOFF_ACK {
            return Err(InstanceLockError::HandoffRejected(reply.trim().to_string()));
        }
        Ok(())
    }

    fn hand_off_with_retry(&self) -> Result<(), InstanceLockError> {
        let mut delays = handoff_backoff().build();
        loop {
            match self.hand_off() {
                Ok(()) => return Ok(()),
                Err(error) => match delays.next() {
                    Some(delay) => {
                        log::debug!("hand-off to port {} failed ({error}); retrying", self.port);
                        std::thread::sleep(delay);
                    }
                    None => return Err(error),
                },
            }
        }
    }

    fn spawn_relay(&mut self, listener: TcpListener) {
        self.local_port = listener.local_addr().ok().map(|addr| addr.port());
        let relay = Arc::clone(&self.relay);
        let spawned = std::thread::Builder::new()
            .name("deeplink-instance-relay".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(error) => {
                            log::warn!("could not accept second launch attempt: {error}");
                            continue;
                        }
                    };
                    let relay = Arc::clone(&relay);
                    let served = std::thread::Builder::new()
                        .name("deeplink-instance-handoff".to_string())
                        .spawn(move || {
                            if let Err(error) = serve_second_launch(stream, &relay) {
                                log::warn!("ignoring second launch attempt: {error}");
                            }
                        });
                    if let Err(error) = served {
                        log::error!("could not serve second launch attempt: {error}");
                    }
                }
            });
        if let Err(error) = spawned {
            log::error!("could not start instance relay thread: {error}");
        }
    }
}

impl InstanceLock for LoopbackInstanceLock {
    fn acquire(&mut self) -> bool {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, self.port)) {
            Ok(listener) => {
                self.spawn_relay(listener);
                log::debug!("instance lock held on 127.0.0.1:{}", self.port);
                true
            }
            Err(error) if error.kind() == std::io::ErrorKind::AddrInUse => {
                // The port is held; an unresponsive holder still counts as a
                // live instance.
                match self.hand_off_with_retry() {
                    Ok(()) => log::info!("handed launch arguments to the running instance"),
                    Err(error) => log::error!(
                        "port {} is held but the launch could not be handed off: {error}",
                        self.port
                    ),
                }
                false
            }
            Err(error) => {
                log::error!("instance lock unavailable ({error}); running without a relay");
                true
            }
        }
    }

    fn on_second_launch(&mut self, listener: SecondLaunchListener) {
        let mut relay = self.relay.lock();
        for launch in relay.buffered.drain(..) {
            listener(launch);
        }
        relay.listener = Some(listener);
    }
}

impl std::fmt::Debug for LoopbackInstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackInstanceLock")
            .field("port", &self.port)
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

/// Reads one launch, relays it, then acknowledges. Acknowledging only after
/// the relay keeps sequential hand-offs in arrival order.
fn serve_second_launch(
    stream: TcpStream,
    relay: &Mutex<RelayState>,
) -> Result<(), InstanceLockError> {
    stream.set_read_timeout(Some(HANDOFF_TIMEOUT))?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let launch = serde_json::from_str(line.trim_end()).map_err(InstanceLockError::Decode)?;
    relay.lock().relay(launch);

    let mut stream = reader.into_inner();
    stream.write_all(format!("{HANDOFF_ACK}\n").as_bytes())?;
    Ok(())
}
