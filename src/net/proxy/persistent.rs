//! A cache of idle upstream connections.
//!
//! A [`Transport`] keeps connections to a single upstream address after a
//! query has finished with them so the next query can skip the dial and
//! handshake. Connections are kept in one bucket per [`TransportType`].
//! Within a bucket they are ordered by the time they were handed back,
//! oldest first.
//!
//! A background task started through [`Transport::start`] periodically
//! closes connections that have been idle for longer than the configured
//! expire time. [`Transport::stop`] makes that task close everything that
//! is left and terminate. Connections handed back after that are closed
//! right away.
//!
//! Closing never happens while the transport's lock is held. Connections
//! taken out of the buckets are closed on their own task so an upstream
//! that is slow to tear down does not hold up anyone else.

use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::fmt;
use std::sync::{Arc, OnceLock};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
#[cfg(feature = "tls")]
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, trace};

use super::conn::{PersistConn, TransportType, UpstreamConn, UpstreamStream};
use super::error::Error;
use crate::utils::config::DefMinMax;

//------------ Configuration Constants ---------------------------------------

/// Default expire time for idle connections.
///
/// Zero expires every connection on the next sweep. Assume that one hour is
/// more than enough as maximum.
const EXPIRE: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(10),
    Duration::ZERO,
    Duration::from_secs(3600),
);

/// Period of the sweep for expired connections.
const SWEEP_INTERVAL: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(10),
    Duration::from_millis(1),
    Duration::from_secs(3600),
);

/// Limits for the dial timeout derived from the dial-time average.
///
/// The average starts out at half the maximum.
const DIAL_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(15),
    Duration::from_secs(1),
    Duration::from_secs(30),
);

/// Weight of a new observation in the dial-time average.
const DIAL_TIME_WEIGHT: i64 = 4;

//------------ Config --------------------------------------------------------

/// Configuration for a persistent transport.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long a connection may stay idle before it is closed.
    expire: Duration,

    /// How often to look for expired connections.
    sweep_interval: Duration,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the expire time.
    pub fn expire(&self) -> Duration {
        self.expire
    }

    /// Sets the expire time.
    ///
    /// Excessive values are quietly trimmed.
    pub fn set_expire(&mut self, expire: Duration) {
        self.expire = EXPIRE.limit(expire)
    }

    /// Returns the sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Sets the sweep interval.
    ///
    /// The interval is independent of the expire time. With the default of
    /// ten seconds a connection may outlive a shorter expire time by up to
    /// one interval.
    ///
    /// Excessive values are quietly trimmed.
    pub fn set_sweep_interval(&mut self, interval: Duration) {
        self.sweep_interval = SWEEP_INTERVAL.limit(interval)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            expire: EXPIRE.default(),
            sweep_interval: SWEEP_INTERVAL.default(),
        }
    }
}

//------------ Transport -----------------------------------------------------

/// Idle connections to one upstream address.
///
/// The transport is shared between the tasks answering queries and its
/// sweep task, so it normally lives in an [`Arc`].
pub struct Transport<C = UpstreamStream> {
    /// Name of the proxy owning the transport, used in log events.
    name: Arc<str>,

    /// Address of the upstream.
    addr: String,

    /// Everything that is guarded by the lock.
    state: Mutex<State<C>>,

    /// Period of the sweep task.
    sweep_interval: Duration,

    /// Moving average of dial times in nanoseconds.
    avg_dial_time: AtomicU64,

    /// The stop signal. Holds true once the transport has been stopped.
    stop: watch::Sender<bool>,

    /// The runtime the sweep task was started on.
    ///
    /// Closes requested from outside a runtime are spawned here.
    runtime: OnceLock<Handle>,
}

/// The part of a [`Transport`] protected by its lock.
struct State<C> {
    /// One bucket per transport type, ordered by last use.
    conns: [Vec<PersistConn<C>>; TransportType::COUNT],

    /// After this long without use a connection is expired.
    expire: Duration,

    /// TLS configuration for dialing new TLS connections.
    #[cfg(feature = "tls")]
    tls_config: Option<Arc<ClientConfig>>,
}

impl<C> Transport<C> {
    /// Creates a new transport for the upstream at `addr`.
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self::with_config(name, addr, Default::default())
    }

    /// Creates a new transport with the given configuration.
    pub fn with_config(
        name: impl Into<String>,
        addr: impl Into<String>,
        config: Config,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            name: name.into().into(),
            addr: addr.into(),
            state: Mutex::new(State {
                conns: Default::default(),
                expire: config.expire,
                #[cfg(feature = "tls")]
                tls_config: None,
            }),
            sweep_interval: config.sweep_interval,
            avg_dial_time: AtomicU64::new(duration_nanos(
                DIAL_TIMEOUT.max() / 2,
            )),
            stop,
            runtime: OnceLock::new(),
        }
    }

    /// Returns the name of the proxy this transport belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the address of the upstream.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns the current expire time.
    pub fn expire(&self) -> Duration {
        self.state.lock().expire
    }

    /// Sets the expire time used by subsequent sweeps.
    ///
    /// Excessive values are quietly trimmed.
    pub fn set_expire(&self, expire: Duration) {
        self.state.lock().expire = EXPIRE.limit(expire);
    }

    /// Sets the TLS configuration for new TLS connections.
    ///
    /// The transport only keeps the configuration for the code that dials
    /// new connections.
    #[cfg(feature = "tls")]
    pub fn set_tls_config(&self, config: impl Into<Arc<ClientConfig>>) {
        self.state.lock().tls_config = Some(config.into());
    }

    /// Returns the TLS configuration for new TLS connections.
    #[cfg(feature = "tls")]
    pub fn tls_config(&self) -> Option<Arc<ClientConfig>> {
        self.state.lock().tls_config.clone()
    }

    /// Returns the number of idle connections of the given type.
    pub fn idle_count(&self, transport_type: TransportType) -> usize {
        self.state.lock().conns[transport_type.index()].len()
    }

    /// Returns whether the transport has been stopped.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Returns the current dial-time average.
    pub fn avg_dial_time(&self) -> Duration {
        Duration::from_nanos(self.avg_dial_time.load(Ordering::Relaxed))
    }

    /// Returns the timeout for dialing a new connection.
    ///
    /// This is twice the dial-time average, kept between one and thirty
    /// seconds.
    pub fn dial_timeout(&self) -> Duration {
        let avg = self.avg_dial_time();
        if avg < DIAL_TIMEOUT.min() {
            DIAL_TIMEOUT.min()
        } else if avg < DIAL_TIMEOUT.max() / 2 {
            2 * avg
        } else {
            DIAL_TIMEOUT.max()
        }
    }

    /// Adds the time a successful dial took to the dial-time average.
    pub fn record_dial_time(&self, dial_time: Duration) {
        let observed =
            i64::try_from(dial_time.as_nanos()).unwrap_or(i64::MAX);
        // The closure always returns Some, so the update cannot fail.
        let _ = self.avg_dial_time.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |avg| {
                let avg = i64::try_from(avg).unwrap_or(i64::MAX);
                let avg = avg + (observed - avg) / DIAL_TIME_WEIGHT;
                Some(u64::try_from(avg).unwrap_or(0))
            },
        );
    }
}

impl<C: UpstreamConn> Transport<C> {
    /// Starts the sweep task.
    ///
    /// The returned handle resolves once the task has closed all remaining
    /// connections after [`stop`](Self::stop). Each call spawns another
    /// task, so this should be called only once.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = Handle::current();
        let _ = self.runtime.set(runtime.clone());
        let transport = self.clone();
        let first_sweep = Instant::now() + self.sweep_interval;
        runtime.spawn(
            async move { transport.conn_manager(first_sweep).await },
        )
    }

    /// Stops the transport.
    ///
    /// The sweep task closes all idle connections and terminates. This
    /// method does not wait for that.
    ///
    /// # Panics
    ///
    /// Panics if the transport was stopped before.
    pub fn stop(&self) {
        if let Err(err) = self.try_stop() {
            panic!("{}: {err}", self.name);
        }
    }

    /// Stops the transport or reports that it had already been stopped.
    pub fn try_stop(&self) -> Result<(), Error> {
        let fired = self.stop.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if fired {
            debug!(proxy = %self.name, "Stopping transport");
            Ok(())
        } else {
            Err(Error::AlreadyStopped)
        }
    }

    /// Hands a connection back for reuse.
    ///
    /// The connection is marked as used now. If the transport was stopped,
    /// it is closed instead.
    ///
    /// This may be called from any thread. Outside of a Tokio runtime the
    /// close is spawned on the runtime the transport was started on. If
    /// there is none, the connection is simply dropped.
    pub fn yield_conn(&self, mut pc: PersistConn<C>) {
        let mut state = self.state.lock();

        if *self.stop.borrow() {
            drop(state);
            trace!(
                proxy = %self.name,
                "Transport stopped, closing returned connection"
            );
            self.close_in_background(vec![pc]);
            return;
        }

        // Stamping under the lock keeps each bucket ordered by last use.
        pc.touch();
        let bucket = pc.conn().transport_type().index();
        state.conns[bucket].push(pc);
    }

    /// Takes the most recently used idle connection of the given type.
    ///
    /// Returns `None` if there is no connection that has been idle for less
    /// than the expire time. If the most recent connection has expired, all
    /// others have as well and the whole bucket is closed.
    pub fn take(
        &self,
        transport_type: TransportType,
    ) -> Option<PersistConn<C>> {
        let mut state = self.state.lock();
        if *self.stop.borrow() {
            return None;
        }
        let expire = state.expire;
        let stack = &mut state.conns[transport_type.index()];
        let fresh = stack.last()?.used().elapsed() < expire;
        if fresh {
            return stack.pop();
        }
        let stale = mem::take(stack);
        drop(state);
        trace!(
            proxy = %self.name,
            %transport_type,
            count = stale.len(),
            "All idle connections expired"
        );
        self.close_in_background(stale);
        None
    }

    /// Runs the sweep until the transport is stopped.
    async fn conn_manager(&self, first_sweep: Instant) {
        let mut stop = self.stop.subscribe();
        debug!(
            proxy = %self.name,
            addr = %self.addr,
            "Connection manager started"
        );

        let stopped = *stop.borrow_and_update();
        if !stopped {
            let mut ticker = interval_at(first_sweep, self.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.cleanup(false),
                    _ = stop.changed() => break,
                }
            }
        }

        self.cleanup(true);
        debug!(proxy = %self.name, "Connection manager terminated");
    }

    /// Removes connections from the buckets and closes them.
    ///
    /// With `all` every connection goes, otherwise only those that have
    /// been idle for at least the expire time.
    fn cleanup(&self, all: bool) {
        let mut removed: Vec<Vec<PersistConn<C>>> = Vec::new();
        {
            let mut state = self.state.lock();
            let stale_time = Instant::now().checked_sub(state.expire);
            for transport_type in TransportType::ALL {
                let stack = &mut state.conns[transport_type.index()];
                if stack.is_empty() {
                    continue;
                }
                if all {
                    trace!(
                        proxy = %self.name,
                        %transport_type,
                        count = stack.len(),
                        "Flushing idle connections"
                    );
                    removed.push(mem::take(stack));
                    continue;
                }

                // If the clock hasn't run for expire yet, nothing can be
                // stale.
                let Some(stale_time) = stale_time else {
                    continue;
                };
                if !stack[0].is_stale(stale_time) {
                    continue;
                }

                // The bucket is sorted by last use, so the stale
                // connections are a prefix.
                let good =
                    stack.partition_point(|pc| pc.is_stale(stale_time));
                trace!(
                    proxy = %self.name,
                    %transport_type,
                    count = good,
                    "Expiring idle connections"
                );
                removed.push(stack.drain(..good).collect());
            }
        }

        // The connections are not reachable through the transport anymore,
        // so they can be closed without the lock.
        for conns in removed {
            self.close_in_background(conns);
        }
    }

    /// Closes connections on a separate task.
    ///
    /// Without a runtime to spawn on, the connections are dropped, which
    /// still releases their sockets.
    fn close_in_background(&self, conns: Vec<PersistConn<C>>) {
        let runtime = Handle::try_current()
            .ok()
            .or_else(|| self.runtime.get().cloned());
        match runtime {
            Some(runtime) => {
                runtime.spawn(close_conns(self.name.clone(), conns));
            }
            None => {
                trace!(
                    proxy = %self.name,
                    count = conns.len(),
                    "No runtime, dropping connections"
                );
                drop(conns);
            }
        }
    }
}

impl<C> fmt::Debug for Transport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("sweep_interval", &self.sweep_interval)
            .field("stopped", &*self.stop.borrow())
            .finish_non_exhaustive()
    }
}

//------------ Utility -------------------------------------------------------

/// Closes all connections concurrently.
///
/// Errors are logged and otherwise ignored, the connections are gone either
/// way.
async fn close_conns<C: UpstreamConn>(
    name: Arc<str>,
    conns: Vec<PersistConn<C>>,
) {
    let results =
        join_all(conns.into_iter().map(|pc| pc.into_conn().close())).await;
    for err in results.into_iter().filter_map(Result::err) {
        trace!(proxy = %name, "Error closing connection: {err}");
    }
}

/// Converts a duration into nanoseconds, saturating at `u64::MAX`.
fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

//============ Tests =========================================================
