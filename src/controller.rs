use std::cell::Cell;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    ErrorInfo, FetchConfig, FetchError, FetchState, FetchStatus, Result, Transport,
};

thread_local! {
    // Identity of the controller whose hook is running on this thread.
    static DISPATCHING: Cell<usize> = const { Cell::new(0) };
}

enum Command {
    Start,
    Cancel,
    StopPolling,
    Reconfigure(String),
}

/// Token of the logical attempt (including its retry delay) plus the current
/// URL. Held only for short critical sections, never while hooks run.
struct Slot {
    attempt: Option<CancellationToken>,
    url: String,
}

struct Shared<T> {
    state: watch::Sender<FetchState<T>>,
    slot: Mutex<Slot>,
    /// Held by the driver while it mutates state or runs hooks; `dispose`
    /// takes it to wait for a running hook.
    gate: Mutex<()>,
    lifetime: CancellationToken,
}

impl<T> Shared<T> {
    fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as *const () as usize
    }

    fn supersede(&self) {
        if let Some(attempt) = lock(&self.slot).attempt.take() {
            attempt.cancel();
        }
    }
}

/// Drives one logical resource through fetch, retry, poll and cancellation.
///
/// All state transitions and hook invocations run on a single spawned task,
/// in order. The public methods never block on the network; they cancel the
/// current attempt synchronously and hand the rest to that task, so a
/// superseded response can never overwrite fresher state.
///
/// Dropping the controller disposes it.
pub struct FetchController<T = Value> {
    shared: Arc<Shared<T>>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl<T> FetchController<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates the controller and spawns its driver on the current Tokio
    /// runtime. With `auto_fetch` the first attempt starts immediately and the
    /// returned controller already reports `loading`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, like [`tokio::spawn`].
    pub fn new(config: FetchConfig<T>, transport: impl Transport + 'static) -> Result<Self> {
        validate_url(&config.url)?;

        let (state, _) = watch::channel(FetchState::initial(config.auto_fetch));
        let shared = Arc::new(Shared {
            state,
            slot: Mutex::new(Slot {
                attempt: None,
                url: config.url.clone(),
            }),
            gate: Mutex::new(()),
            lifetime: CancellationToken::new(),
        });
        let (commands, receiver) = mpsc::unbounded_channel();

        let driver = Driver {
            config,
            transport: Arc::new(transport),
            shared: Arc::clone(&shared),
            commands: receiver,
            in_flight: None,
            retry_count: 0,
            retry_delay: None,
            poll: None,
            linger: None,
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            shared,
            commands,
            task,
        })
    }
}

impl<T> FetchController<T> {
    /// Starts a fresh attempt, cancelling any attempt still in flight.
    pub fn start(&self) {
        if self.shared.lifetime.is_cancelled() {
            return;
        }
        self.shared.supersede();
        self.send(Command::Start);
    }

    /// Alias for [`start`](Self::start).
    pub fn refetch(&self) {
        self.start();
    }

    /// Cancels the in-flight attempt and any pending retry delay.
    ///
    /// Data, error, the retry counter and the poll timer are left as they are.
    pub fn cancel(&self) {
        if self.shared.lifetime.is_cancelled() {
            return;
        }
        self.shared.supersede();
        self.send(Command::Cancel);
    }

    /// Stops the recurring poll timer. A later success starts a new one.
    pub fn stop_polling(&self) {
        self.send(Command::StopPolling);
    }

    /// Points the controller at a different resource.
    ///
    /// The outstanding attempt and the poll timer of the old URL are dropped,
    /// the retry counter is reset, and the new URL is fetched if `auto_fetch`
    /// is set. Reconfiguring to the current URL does nothing.
    pub fn reconfigure(&self, url: impl Into<String>) -> Result<()> {
        let url = url.into();
        validate_url(&url)?;
        if self.shared.lifetime.is_cancelled() {
            return Ok(());
        }

        {
            let mut slot = lock(&self.shared.slot);
            if slot.url == url {
                return Ok(());
            }
            slot.url.clone_from(&url);
            if let Some(attempt) = slot.attempt.take() {
                attempt.cancel();
            }
        }
        self.send(Command::Reconfigure(url));
        Ok(())
    }

    /// Stops all work for good.
    ///
    /// Cancels the in-flight attempt, the retry delay and the poll timer. Once
    /// this returns no hook runs and the state no longer changes, apart from
    /// the final `Disposed` snapshot published here. Calling it again is a
    /// no-op.
    pub fn dispose(&self) {
        if self.shared.lifetime.is_cancelled() {
            return;
        }

        // A hook of this controller disposing it would otherwise wait on itself.
        let reentrant = DISPATCHING.with(|current| current.get() == self.shared.id());
        let _gate = (!reentrant).then(|| lock(&self.shared.gate));

        self.shared.lifetime.cancel();
        self.shared.supersede();
        self.task.abort();
        self.shared.state.send_modify(|state| {
            state.loading = false;
            state.status = FetchStatus::Disposed;
        });

        #[cfg(feature = "tracing")]
        tracing::debug!("fetch controller disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lifetime.is_cancelled()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
        self.shared.state.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.state.borrow().loading
    }

    pub fn status(&self) -> FetchStatus {
        self.shared.state.borrow().status
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        self.shared.state.borrow().error.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            #[cfg(feature = "tracing")]
            tracing::trace!("fetch controller driver is gone; command dropped");
        }
    }
}

impl<T: Clone> FetchController<T> {
    /// Snapshot of the current state.
    pub fn state(&self) -> FetchState<T> {
        self.shared.state.borrow().clone()
    }

    pub fn data(&self) -> Option<T> {
        self.shared.state.borrow().data.clone()
    }
}

impl<T> Drop for FetchController<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct InFlight {
    cancel: CancellationToken,
    started: Instant,
    response: BoxFuture<'static, Result<Value>>,
}

struct RetryDelay {
    cancel: CancellationToken,
    sleep: Pin<Box<Sleep>>,
}

enum Event {
    Command(Command),
    Settled(Result<Value>),
    RetryDue,
    PollTick,
    LingerElapsed,
    Shutdown,
}

struct Driver<T> {
    config: FetchConfig<T>,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared<T>>,
    commands: mpsc::UnboundedReceiver<Command>,
    in_flight: Option<InFlight>,
    /// Consecutive failures since the last success.
    retry_count: u32,
    retry_delay: Option<RetryDelay>,
    poll: Option<Interval>,
    /// Keeps `loading` visible until the minimum duration has passed.
    linger: Option<Pin<Box<Sleep>>>,
}

impl<T> Driver<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn run(mut self) {
        if self.config.auto_fetch {
            let shared = Arc::clone(&self.shared);
            let _gate = lock(&shared.gate);
            if shared.lifetime.is_cancelled() {
                return;
            }
            self.begin_attempt();
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = self.shared.lifetime.cancelled() => Event::Shutdown,
                command = self.commands.recv() => command.map_or(Event::Shutdown, Event::Command),
                outcome = response(&mut self.in_flight) => Event::Settled(outcome),
                _ = retry_due(&mut self.retry_delay) => Event::RetryDue,
                _ = tick(&mut self.poll) => Event::PollTick,
                _ = elapsed(&mut self.linger) => Event::LingerElapsed,
            };

            let shared = Arc::clone(&self.shared);
            let _gate = lock(&shared.gate);
            if shared.lifetime.is_cancelled() {
                break;
            }

            match event {
                Event::Shutdown => break,
                Event::Command(Command::Start) => self.begin_attempt(),
                Event::Command(Command::Cancel) => self.cancel(),
                Event::Command(Command::StopPolling) => self.stop_polling(),
                Event::Command(Command::Reconfigure(url)) => self.reconfigure(url),
                Event::Settled(outcome) => self.settle(outcome),
                Event::RetryDue => {
                    if let Some(delay) = self.retry_delay.take() {
                        if !delay.cancel.is_cancelled() {
                            self.begin_attempt();
                        }
                    }
                }
                Event::PollTick => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(url = %self.config.url, "poll tick");
                    self.begin_attempt();
                }
                Event::LingerElapsed => {
                    self.linger = None;
                    self.shared.state.send_modify(|state| state.loading = false);
                }
            }
        }

        self.abort_attempt();
    }

    fn begin_attempt(&mut self) {
        self.abort_attempt();
        self.linger = None;

        let cancel = self.shared.lifetime.child_token();
        lock(&self.shared.slot).attempt = Some(cancel.clone());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            url = %self.config.url,
            retry = self.retry_count,
            "starting fetch attempt"
        );

        let transport = Arc::clone(&self.transport);
        let url = self.config.url.clone();
        let token = cancel.clone();
        self.in_flight = Some(InFlight {
            cancel,
            started: Instant::now(),
            response: Box::pin(async move { transport.fetch(&url, token).await }),
        });

        self.shared.state.send_modify(|state| {
            state.loading = true;
            state.status = FetchStatus::Loading;
        });
    }

    fn settle(&mut self, outcome: Result<Value>) {
        let Some(attempt) = self.in_flight.take() else {
            return;
        };
        if !self.claim(&attempt.cancel) {
            #[cfg(feature = "tracing")]
            tracing::trace!(url = %self.config.url, "dropping superseded response");
            return;
        }

        match outcome.and_then(|raw| self.decode(raw)) {
            Ok(result) => self.succeed(result, attempt.started),
            Err(FetchError::Cancelled) => {
                self.shared.state.send_modify(|state| {
                    state.loading = false;
                    state.status = FetchStatus::Idle;
                });
            }
            Err(_err) if self.retry_count < self.config.retry_on_fail_count => {
                self.retry_count += 1;

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    url = %self.config.url,
                    retry = self.retry_count,
                    delay_ms = self.config.retry_on_fail_interval.as_millis() as u64,
                    error = %_err,
                    "scheduling retry"
                );

                // The retry still belongs to this attempt; `cancel()` must reach it.
                lock(&self.shared.slot)
                    .attempt
                    .get_or_insert_with(|| attempt.cancel.clone());
                self.retry_delay = Some(RetryDelay {
                    cancel: attempt.cancel,
                    sleep: Box::pin(time::sleep(self.config.retry_on_fail_interval)),
                });
                self.shared
                    .state
                    .send_modify(|state| state.status = FetchStatus::Retrying);
            }
            Err(err) => self.fail(err, attempt.started),
        }
    }

    /// Marks the attempt as concluded unless it was cancelled first. Runs
    /// before the transformer so a superseded payload is never decoded.
    fn claim(&self, cancel: &CancellationToken) -> bool {
        let mut slot = lock(&self.shared.slot);
        if cancel.is_cancelled() {
            return false;
        }
        slot.attempt = None;
        true
    }

    fn decode(&self, raw: Value) -> Result<T> {
        match &self.config.transformer {
            Some(transform) => transform(raw),
            None => serde_json::from_value(raw).map_err(|err| {
                FetchError::Decode(format!("payload does not match result type: {err}"))
            }),
        }
    }

    fn succeed(&mut self, result: T, started: Instant) {
        self.retry_count = 0;
        let linger = self.loading_floor(started);
        let data = result.clone();
        self.shared.state.send_modify(|state| {
            state.data = Some(data);
            state.error = None;
            state.loading = linger.is_some();
            state.status = FetchStatus::Success;
        });
        self.linger = linger.map(|deadline| Box::pin(time::sleep_until(deadline)));

        if let Some(hook) = &self.config.on_success {
            self.dispatch(|| hook(&result));
        }

        if self.poll.is_none() {
            if let Some(period) = self.config.poll_period() {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    url = %self.config.url,
                    period_ms = period.as_millis() as u64,
                    "starting poll timer"
                );

                let mut interval = time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.poll = Some(interval);
            }
        }
    }

    fn fail(&mut self, err: FetchError, started: Instant) {
        self.stop_polling();

        #[cfg(feature = "tracing")]
        tracing::debug!(url = %self.config.url, error = %err, "fetch failed");

        let error: ErrorInfo = Arc::new(err);
        let linger = self.loading_floor(started);
        let published = Arc::clone(&error);
        self.shared.state.send_modify(|state| {
            state.error = Some(published);
            state.loading = linger.is_some();
            state.status = FetchStatus::Failed;
        });
        self.linger = linger.map(|deadline| Box::pin(time::sleep_until(deadline)));

        if let Some(hook) = &self.config.on_error {
            self.dispatch(|| hook(&error));
        }
    }

    fn cancel(&mut self) {
        let was_active = self.abort_attempt() || self.stranded();
        let was_lingering = self.linger.take().is_some();
        if !was_active && !was_lingering {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(url = %self.config.url, "fetch cancelled");

        self.shared.state.send_modify(|state| {
            state.loading = false;
            if was_active {
                state.status = FetchStatus::Idle;
            }
        });
    }

    fn reconfigure(&mut self, url: String) {
        if url == self.config.url {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(from = %self.config.url, to = %url, "switching resource");

        let was_active = self.abort_attempt() || self.stranded();
        self.linger = None;
        self.stop_polling();
        self.retry_count = 0;
        self.config.url = url;

        if self.config.auto_fetch {
            self.begin_attempt();
        } else if was_active {
            self.shared.state.send_modify(|state| {
                state.loading = false;
                state.status = FetchStatus::Idle;
            });
        }
    }

    /// The published state still shows an attempt, but its response or
    /// retry was dropped after a synchronous cancel.
    fn stranded(&self) -> bool {
        matches!(
            self.shared.state.borrow().status,
            FetchStatus::Loading | FetchStatus::Retrying
        )
    }

    fn stop_polling(&mut self) {
        if self.poll.take().is_some() {
            #[cfg(feature = "tracing")]
            tracing::debug!(url = %self.config.url, "poll timer stopped");
        }
    }

    /// Drops the in-flight request and any pending retry. Returns whether
    /// either existed.
    fn abort_attempt(&mut self) -> bool {
        let mut was_active = false;
        if let Some(attempt) = self.in_flight.take() {
            attempt.cancel.cancel();
            was_active = true;
        }
        if let Some(delay) = self.retry_delay.take() {
            delay.cancel.cancel();
            was_active = true;
        }
        was_active
    }

    /// `None` when the attempt already ran longer than the configured floor.
    fn loading_floor(&self, started: Instant) -> Option<Instant> {
        if self.config.min_loading.is_zero() {
            return None;
        }
        let deadline = started + self.config.min_loading;
        (deadline > Instant::now()).then_some(deadline)
    }

    fn dispatch(&self, hook: impl FnOnce()) {
        let _dispatching = Dispatching::enter(self.shared.id());
        hook();
    }
}

struct Dispatching {
    previous: usize,
}

impl Dispatching {
    fn enter(id: usize) -> Self {
        Self {
            previous: DISPATCHING.with(|current| current.replace(id)),
        }
    }
}

impl Drop for Dispatching {
    fn drop(&mut self) {
        DISPATCHING.with(|current| current.set(self.previous));
    }
}

async fn response(in_flight: &mut Option<InFlight>) -> Result<Value> {
    match in_flight {
        Some(attempt) => (&mut attempt.response).await,
        None => std::future::pending().await,
    }
}

async fn retry_due(delay: &mut Option<RetryDelay>) {
    match delay {
        Some(delay) => delay.sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn validate_url(url: &str) -> Result<()> {
    if url.trim().is_empty() {
        return Err(FetchError::Config("url must not be empty".to_owned()));
    }
    Ok(())
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
