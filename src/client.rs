//! Stateful, thread-safe client for an ADAM-5000/TCP rack.
//!
//! The client moves through three states:
//!
//! * **Disconnected** - no transport.
//! * **Idle** - connected; reads and writes are executed immediately on the
//!   calling thread.
//! * **Polling** - a background thread owns the transport. Every interval it
//!   either executes the oldest queued write or refreshes the
//!   [`DeviceSnapshot`] with a full read of both slot groups, then notifies
//!   the tick callback. Writes are queued, reads are answered from the
//!   snapshot. Polling can be paused without stopping the thread.
//!
//! ## Example
//!
//! ```no_run
//! use adam5k_lib::client::Adam5K;
//! use adam5k_lib::protocol::{ChannelAddress, ChannelValue, RackAddress, SlotGroup};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Adam5K::new();
//!     client.connect("10.10.10.11", 502, RackAddress::default())?;
//!     client.set_tick_callback(|tick| println!("{:?}", tick.outcome));
//!     client.start_polling(Duration::from_secs(1))?;
//!
//!     let valve = ChannelAddress::new(SlotGroup::Analog, 2, 0)?;
//!     client.write_channel(valve, ChannelValue::Analog(1222))?;
//!
//!     std::thread::sleep(Duration::from_secs(5));
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

use crate::protocol::{self as proto, ChannelAddress, ChannelValue, Operation, RackAddress, SlotGroup, SlotPattern};
use crate::snapshot::DeviceSnapshot;
use crate::transport::{self, TcpTransport, Transport, DEFAULT_CONNECT_TIMEOUT};
use crate::{Result, StateError};
use log::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Default interval between two polling ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const POLLING_THREAD_NAME: &str = "adam5k-polling";

/// Observable state of the client. Pausing is reported by [`Adam5K::is_paused`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Idle,
    Polling,
}

/// What a successful polling tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    /// The oldest queued write was sent to the rack.
    CommandExecuted,
    /// Both slot groups were read and the snapshot replaced.
    SnapshotRefreshed,
}

/// Notification passed to the tick callback after every polling tick.
#[derive(Debug)]
pub struct Tick {
    /// Result of the tick. A failed tick does not stop the polling thread.
    pub outcome: Result<TickKind>,
    /// Copy of the snapshot after the tick.
    pub snapshot: DeviceSnapshot,
}

/// Called on the polling thread after every tick that was not paused.
///
/// The callback must not block. It may replace or clear itself, but calling
/// [`Adam5K::stop_polling`] or [`Adam5K::disconnect`] from it is refused.
pub type TickCallback = Box<dyn FnMut(&Tick) + Send>;

/// An encoded write waiting for its polling tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand(Vec<u8>);

impl PendingCommand {
    pub fn frame(&self) -> &[u8] {
        &self.0
    }
}

/// Connection settings of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    /// Bound for every send and receive, `None` blocks until the rack answers.
    pub io_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: None,
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared with the polling thread.
struct Shared {
    paused: AtomicBool,
    interval: Mutex<Duration>,
    queue: Mutex<VecDeque<PendingCommand>>,
    snapshot: Mutex<DeviceSnapshot>,
    callback: Mutex<CallbackSlot>,
}

/// The generation changes whenever the callback is replaced or cleared.
#[derive(Default)]
struct CallbackSlot {
    callback: Option<TickCallback>,
    generation: u64,
}

impl Shared {
    /// Reads both slot groups and replaces the snapshot once both succeeded.
    fn read_all(&self, transport: &mut dyn Transport, rack: RackAddress) -> Result<DeviceSnapshot> {
        let mut fresh = *lock(&self.snapshot);
        for group in SlotGroup::ALL {
            let response =
                transport::execute(&mut *transport, &proto::default_read_all_command(rack, group))?;
            let payload = proto::response_payload(&response);
            fresh.apply(group, &proto::parse_payload(group, payload));
        }
        *lock(&self.snapshot) = fresh;
        Ok(fresh)
    }

    fn tick(&self, transport: &mut dyn Transport, rack: RackAddress) -> Result<TickKind> {
        let next = lock(&self.queue).pop_front();
        match next {
            Some(command) => {
                transport::execute(transport, command.frame())?;
                Ok(TickKind::CommandExecuted)
            }
            None => {
                self.read_all(transport, rack)?;
                Ok(TickKind::SnapshotRefreshed)
            }
        }
    }

    /// Runs the callback outside the lock, so it may call back into the client.
    fn notify(&self, tick: &Tick) {
        let (callback, generation) = {
            let mut slot = lock(&self.callback);
            (slot.callback.take(), slot.generation)
        };
        if let Some(mut callback) = callback {
            callback(tick);
            let mut slot = lock(&self.callback);
            if slot.generation == generation {
                slot.callback = Some(callback);
            }
        }
    }

    fn replace_callback(&self, callback: Option<TickCallback>) {
        let mut slot = lock(&self.callback);
        slot.callback = callback;
        slot.generation = slot.generation.wrapping_add(1);
    }
}

fn polling_loop(
    mut transport: Box<dyn Transport>,
    rack: RackAddress,
    shared: Arc<Shared>,
    stop: mpsc::Receiver<()>,
) -> Box<dyn Transport> {
    info!("Polling of rack {rack} started");
    loop {
        let interval = *lock(&shared.interval);
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.paused.load(Ordering::Acquire) {
            continue;
        }

        let outcome = shared.tick(transport.as_mut(), rack);
        match &outcome {
            Ok(kind) => trace!("Tick: {kind:?}"),
            Err(err) => warn!("Polling tick failed: {err}"),
        }
        let tick = Tick {
            outcome,
            snapshot: *lock(&shared.snapshot),
        };
        shared.notify(&tick);
    }
    info!("Polling of rack {rack} stopped");
    transport
}

struct PollingSession {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<Box<dyn Transport>>,
}

impl PollingSession {
    fn thread_id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    fn is_current_thread(&self) -> bool {
        self.thread_id() == thread::current().id()
    }

    /// Signals the thread and waits for it, returning the transport it owned.
    fn join(self) -> Option<Box<dyn Transport>> {
        drop(self.stop);
        self.handle.join().ok()
    }
}

enum Link {
    Disconnected,
    Idle {
        transport: Box<dyn Transport>,
        rack: RackAddress,
    },
    Polling {
        session: PollingSession,
        rack: RackAddress,
    },
    /// The polling thread was signalled and is being joined.
    Stopping {
        rack: RackAddress,
        polling_thread: ThreadId,
    },
}

impl Link {
    fn state(&self) -> ClientState {
        match self {
            Link::Disconnected => ClientState::Disconnected,
            Link::Idle { .. } => ClientState::Idle,
            Link::Polling { .. } | Link::Stopping { .. } => ClientState::Polling,
        }
    }
}

/// Client for one rack, safe to share between threads.
pub struct Adam5K {
    options: ClientOptions,
    link: Mutex<Link>,
    /// Signalled when a join leaves the `Stopping` state.
    stopped: Condvar,
    shared: Arc<Shared>,
}

impl Default for Adam5K {
    fn default() -> Self {
        Self::new()
    }
}

impl Adam5K {
    pub fn new() -> Self {
        Self::with_options(ClientOptions::default())
    }

    pub fn with_options(options: ClientOptions) -> Self {
        Self {
            options,
            link: Mutex::new(Link::Disconnected),
            stopped: Condvar::new(),
            shared: Arc::new(Shared {
                paused: AtomicBool::new(false),
                interval: Mutex::new(DEFAULT_POLL_INTERVAL),
                queue: Mutex::new(VecDeque::new()),
                snapshot: Mutex::new(DeviceSnapshot::default()),
                callback: Mutex::new(CallbackSlot::default()),
            }),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Opens the TCP connection to the rack.
    ///
    /// The attempt is bounded by the connect timeout and never retried.
    /// On failure the client stays disconnected.
    pub fn connect(&self, host: &str, port: u16, rack: RackAddress) -> Result<()> {
        let mut link = lock(&self.link);
        if !matches!(*link, Link::Disconnected) {
            warn!("connect: already connected");
            return Err(StateError::AlreadyConnected.into());
        }
        let transport = TcpTransport::connect(
            host,
            port,
            self.options.connect_timeout,
            self.options.io_timeout,
        )
        .inspect_err(|err| error!("connect: {err}"))?;
        info!("Connected to {} (rack {rack})", transport.peer_addr());
        *link = Link::Idle {
            transport: Box::new(transport),
            rack,
        };
        Ok(())
    }

    /// Uses an already established transport instead of opening a TCP connection.
    pub fn attach(&self, transport: impl Transport + 'static, rack: RackAddress) -> Result<()> {
        let mut link = lock(&self.link);
        if !matches!(*link, Link::Disconnected) {
            warn!("attach: already connected");
            return Err(StateError::AlreadyConnected.into());
        }
        *link = Link::Idle {
            transport: Box::new(transport),
            rack,
        };
        debug!("Transport attached (rack {rack})");
        Ok(())
    }

    /// Stops polling if needed, closes the connection and drops queued writes.
    pub fn disconnect(&self) {
        let mut first_pass = true;
        loop {
            let mut link = lock(&self.link);
            match std::mem::replace(&mut *link, Link::Disconnected) {
                Link::Disconnected if first_pass => {
                    debug!("disconnect: not connected");
                    return;
                }
                // The polling thread was lost while stopping.
                Link::Disconnected => break,
                Link::Idle { mut transport, .. } => {
                    transport.shutdown();
                    break;
                }
                Link::Polling { session, rack } => {
                    if session.is_current_thread() {
                        error!("disconnect: called from the polling thread");
                        *link = Link::Polling { session, rack };
                        return;
                    }
                    *link = Link::Stopping {
                        rack,
                        polling_thread: session.thread_id(),
                    };
                    drop(link);
                    if let Err(err) = self.finish_stop(session, rack) {
                        warn!("disconnect: {err}");
                    }
                }
                Link::Stopping {
                    rack,
                    polling_thread,
                } => {
                    *link = Link::Stopping {
                        rack,
                        polling_thread,
                    };
                    if polling_thread == thread::current().id() {
                        error!("disconnect: called from the polling thread");
                        return;
                    }
                    debug!("disconnect: waiting for the polling thread to be joined");
                    drop(
                        self.stopped
                            .wait_while(link, |link| matches!(link, Link::Stopping { .. }))
                            .unwrap_or_else(PoisonError::into_inner),
                    );
                }
            }
            first_pass = false;
        }

        let dropped = {
            let mut queue = lock(&self.shared.queue);
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            warn!("disconnect: {dropped} pending command(s) discarded");
        }
        info!("Disconnected");
    }

    pub fn state(&self) -> ClientState {
        lock(&self.link).state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() != ClientState::Disconnected
    }

    pub fn is_polling(&self) -> bool {
        self.state() == ClientState::Polling
    }

    /// Hands the transport to a new polling thread ticking every `interval`.
    ///
    /// Only valid while connected and idle.
    pub fn start_polling(&self, interval: Duration) -> Result<()> {
        let mut link = lock(&self.link);
        let (transport, rack) = match std::mem::replace(&mut *link, Link::Disconnected) {
            Link::Idle { transport, rack } => (transport, rack),
            other => {
                let err = match other {
                    Link::Disconnected => StateError::NotConnected,
                    _ => StateError::AlreadyPolling,
                };
                *link = other;
                warn!("start_polling: {err}");
                return Err(err.into());
            }
        };

        *lock(&self.shared.interval) = interval;
        let (stop, stop_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(POLLING_THREAD_NAME.to_string())
            .spawn(move || polling_loop(transport, rack, shared, stop_rx))
            .inspect_err(|err| error!("start_polling: cannot spawn polling thread: {err}"))?;
        *link = Link::Polling {
            session: PollingSession { stop, handle },
            rack,
        };
        debug!("Polling every {interval:?}");
        Ok(())
    }

    /// Stops the polling thread and waits for it to exit.
    ///
    /// An I/O operation in flight completes first. Queued writes stay queued.
    pub fn stop_polling(&self) -> Result<()> {
        let mut link = lock(&self.link);
        let (session, rack) = match std::mem::replace(&mut *link, Link::Disconnected) {
            Link::Polling { session, rack } if !session.is_current_thread() => {
                *link = Link::Stopping {
                    rack,
                    polling_thread: session.thread_id(),
                };
                (session, rack)
            }
            other => {
                let err = match other {
                    Link::Disconnected => StateError::NotConnected,
                    Link::Polling { .. } => StateError::CalledFromPollingThread,
                    _ => StateError::NotPolling,
                };
                *link = other;
                warn!("stop_polling: {err}");
                return Err(err.into());
            }
        };
        drop(link);
        self.finish_stop(session, rack)
    }

    fn finish_stop(&self, session: PollingSession, rack: RackAddress) -> Result<()> {
        let joined = session.join();
        let mut link = lock(&self.link);
        let result = match joined {
            Some(transport) => {
                *link = Link::Idle { transport, rack };
                Ok(())
            }
            None => {
                *link = Link::Disconnected;
                error!("The polling thread panicked, connection lost");
                Err(StateError::PollingThreadLost.into())
            }
        };
        drop(link);
        self.stopped.notify_all();
        result
    }

    /// Suspends polling ticks. The thread keeps running but does no I/O.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Changes the polling interval, effective from the next tick.
    pub fn set_interval(&self, interval: Duration) {
        *lock(&self.shared.interval) = interval;
    }

    pub fn interval(&self) -> Duration {
        *lock(&self.shared.interval)
    }

    pub fn set_tick_callback(&self, callback: impl FnMut(&Tick) + Send + 'static) {
        self.shared.replace_callback(Some(Box::new(callback)));
    }

    pub fn clear_tick_callback(&self) {
        self.shared.replace_callback(None);
    }

    /// Number of writes waiting for a polling tick.
    pub fn pending_commands(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    pub fn clear_commands(&self) {
        lock(&self.shared.queue).clear();
    }

    /// Copy of the last full read.
    pub fn snapshot(&self) -> DeviceSnapshot {
        *lock(&self.shared.snapshot)
    }

    /// Executes `frame` now when idle, queues it while polling.
    fn submit(&self, link: &mut Link, frame: Vec<u8>) -> Result<()> {
        match link {
            Link::Idle { transport, .. } => {
                transport::execute(transport.as_mut(), &frame)?;
                Ok(())
            }
            Link::Polling { .. } | Link::Stopping { .. } => {
                lock(&self.shared.queue).push_back(PendingCommand(frame));
                Ok(())
            }
            Link::Disconnected => Err(StateError::NotConnected.into()),
        }
    }

    fn rack(link: &Link) -> Result<RackAddress> {
        match link {
            Link::Idle { rack, .. } | Link::Polling { rack, .. } | Link::Stopping { rack, .. } => Ok(*rack),
            Link::Disconnected => Err(StateError::NotConnected.into()),
        }
    }

    /// Writes a single channel, deferred to the next tick while polling.
    pub fn write_channel(&self, address: ChannelAddress, value: ChannelValue) -> Result<()> {
        let mut link = lock(&self.link);
        Self::rack(&link)
            .and_then(|rack| proto::encode_single_channel(rack, Operation::Write(value), address))
            .and_then(|frame| self.submit(&mut link, frame))
            .inspect_err(|err| error!("write_channel {address} = {value}: {err}"))
    }

    /// Writes a whole slot, deferred to the next tick while polling.
    pub fn write_slot(&self, slot: u8, pattern: &SlotPattern) -> Result<()> {
        let mut link = lock(&self.link);
        Self::rack(&link)
            .and_then(|rack| proto::encode_slot_bulk(rack, slot, pattern))
            .and_then(|frame| self.submit(&mut link, frame))
            .inspect_err(|err| error!("write_slot {} {slot}: {err}", pattern.group()))
    }

    /// Reads a single channel.
    ///
    /// While polling the value comes from the snapshot without any I/O,
    /// otherwise the channel is read from the rack.
    pub fn read_channel(&self, address: ChannelAddress) -> Result<ChannelValue> {
        let mut link = lock(&self.link);
        match &mut *link {
            Link::Idle { transport, rack } => {
                let frame = proto::encode_single_channel(*rack, Operation::Read, address)?;
                let response = transport::execute(transport.as_mut(), &frame)
                    .inspect_err(|err| error!("read_channel {address}: {err}"))?;
                Ok(proto::decode_single_read(
                    address,
                    proto::response_payload(&response),
                ))
            }
            Link::Polling { .. } | Link::Stopping { .. } => Ok(lock(&self.shared.snapshot).value(address)),
            Link::Disconnected => {
                error!("read_channel {address}: not connected");
                Err(StateError::NotConnected.into())
            }
        }
    }

    /// Reads both slot groups now and replaces the snapshot. Only valid when idle.
    pub fn refresh(&self) -> Result<DeviceSnapshot> {
        let mut link = lock(&self.link);
        match &mut *link {
            Link::Idle { transport, rack } => self
                .shared
                .read_all(transport.as_mut(), *rack)
                .inspect_err(|err| error!("refresh: {err}")),
            other => {
                let err = match other.state() {
                    ClientState::Disconnected => StateError::NotConnected,
                    _ => StateError::AlreadyPolling,
                };
                warn!("refresh: {err}");
                Err(err.into())
            }
        }
    }
}

impl Drop for Adam5K {
    fn drop(&mut self) {
        self.disconnect();
    }
}
