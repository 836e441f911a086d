use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::aggregator::CloseTracker;
use super::backoff::{Backoff, BackoffConfig};
use super::codec::{Codec, Inbound, Outbound};
use super::transport::{Connector, Frame, Transport};
use super::types::{HeartbeatState, IdentifyOptions, ResumeContext, SessionState, ShardInfo};
use crate::dispatch::EventDispatcher;
use crate::error::SendError;
use crate::event::{Event, EventKind, Payload};

const NORMAL_CLOSE: u16 = 1000;
/// Any code other than 1000/1001 keeps the server-side session resumable.
const RESUMABLE_CLOSE: u16 = 4000;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_HEARTBEAT: Duration = Duration::from_millis(1);

/// Per-client settings shared by all of its shard sessions.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Client name, used as the `gateway` log tag and stamped on events.
    pub gateway_name: Arc<str>,
    pub gateway_url: String,
    pub backoff: BackoffConfig,
    /// Unacknowledged heartbeats tolerated before the connection is recycled.
    pub missed_ack_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gateway_name: Arc::from("default"),
            gateway_url: "wss://gateway.discord.gg/?v=10&encoding=json".to_string(),
            backoff: BackoffConfig::default(),
            missed_ack_threshold: 2,
        }
    }
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<SessionConfig>,
    pub connector: Arc<dyn Connector>,
    pub codec: Arc<dyn Codec>,
    pub dispatcher: EventDispatcher,
}

enum Command {
    Close {
        resumable: bool,
        done: oneshot::Sender<()>,
    },
}

struct Shared {
    state: watch::Sender<SessionState>,
    resume: Mutex<Option<ResumeContext>>,
    heartbeat: Mutex<HeartbeatState>,
    /// Present while a driver task is running.
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    tracker: Mutex<Option<Arc<CloseTracker>>>,
}

impl Shared {
    fn notify_closed(&self, index: u32) {
        if let Some(tracker) = &*self.tracker.lock() {
            tracker.session_closed(index);
        }
    }
}

/// Connection lifecycle of one shard.
///
/// All protocol work happens on a single driver task per shard, so state
/// transitions, heartbeat bookkeeping and event publication are serialized.
/// This handle only sends commands to that task and reads snapshots.
pub struct ShardSession {
    options: IdentifyOptions,
    context: SessionContext,
    shared: Arc<Shared>,
}

impl ShardSession {
    pub fn new(options: IdentifyOptions, context: SessionContext) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            options,
            context,
            shared: Arc::new(Shared {
                state,
                resume: Mutex::new(None),
                heartbeat: Mutex::new(HeartbeatState::default()),
                commands: Mutex::new(None),
                tracker: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn attach_tracker(&self, tracker: Arc<CloseTracker>) {
        *self.shared.tracker.lock() = Some(tracker);
    }

    pub fn shard(&self) -> ShardInfo {
        self.options.shard()
    }

    pub fn identify_options(&self) -> &IdentifyOptions {
        &self.options
    }

    /// Spawns the driver task. Does nothing unless the session is fully
    /// disconnected.
    pub fn start(&self) {
        let receiver = {
            let mut commands = self.shared.commands.lock();
            if commands.is_some() {
                debug!(shard = self.options.shard_index(), "session already running");
                return;
            }
            let (sender, receiver) = mpsc::unbounded_channel();
            *commands = Some(sender);
            // re-armed under the commands lock so a concurrent logout cannot
            // mark this shard closed after it started
            if let Some(tracker) = &*self.shared.tracker.lock() {
                tracker.session_started(self.options.shard_index());
            }
            receiver
        };

        let span = info_span!(
            "shard",
            gateway = %self.context.config.gateway_name,
            shard = self.options.shard_index(),
        );
        let driver = Driver {
            options: self.options.clone(),
            context: self.context.clone(),
            shared: Arc::clone(&self.shared),
            commands: receiver,
            backoff: Backoff::new(self.context.config.backoff),
            heartbeat: None,
            attempt: 0,
            reconnecting: false,
        };
        let _ = tokio::spawn(driver.run().instrument(span));
    }

    /// Requests a close. With `resumable == false` this is a logout: the
    /// resume context is discarded and nothing is rescheduled. With
    /// `resumable == true` the session reconnects and resumes right after.
    ///
    /// The returned future resolves once the session is disconnected and its
    /// transport released; it cannot fail.
    pub fn close(&self, resumable: bool) -> impl Future<Output = ()> + Send + 'static {
        let (done, completed) = oneshot::channel();
        let delivered = {
            let commands = self.shared.commands.lock();
            let delivered = match &*commands {
                Some(commands) => commands.send(Command::Close { resumable, done }).is_ok(),
                None => false,
            };
            if !delivered && !resumable {
                self.shared.resume.lock().take();
                self.shared.notify_closed(self.options.shard_index());
            }
            delivered
        };

        async move {
            if delivered {
                let _ = completed.await;
            }
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Round-trip latency of the last acknowledged heartbeat.
    pub fn response_time(&self) -> Option<Duration> {
        self.shared.heartbeat.lock().response_time()
    }

    pub fn heartbeat(&self) -> HeartbeatState {
        self.shared.heartbeat.lock().clone()
    }

    pub fn resume_context(&self) -> Option<ResumeContext> {
        self.shared.resume.lock().clone()
    }
}

/// Why a close was requested.
enum Stop {
    Logout(Option<oneshot::Sender<()>>),
    Restart(oneshot::Sender<()>),
}

impl Stop {
    fn from_command(command: Option<Command>) -> Self {
        match command {
            Some(Command::Close {
                resumable: true,
                done,
            }) => Stop::Restart(done),
            Some(Command::Close {
                resumable: false,
                done,
            }) => Stop::Logout(Some(done)),
            None => Stop::Logout(None),
        }
    }

    fn resumable(&self) -> bool {
        matches!(self, Stop::Restart(_))
    }
}

enum Ended {
    Stopped(Stop),
    Lost,
}

enum Flow {
    Continue,
    Reconnect { resumable: bool },
}

struct Driver {
    options: IdentifyOptions,
    context: SessionContext,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    backoff: Backoff,
    heartbeat: Option<Interval>,
    /// Connect attempts since the last successful handshake.
    attempt: u32,
    reconnecting: bool,
}

impl Driver {
    async fn run(mut self) {
        let mut delay = false;

        loop {
            if delay {
                let wait = self.backoff.next_delay();
                self.set_state(SessionState::Reconnecting);
                info!(delay_ms = wait.as_millis() as u64, "reconnecting");

                tokio::select! {
                    _ = time::sleep(wait) => {}
                    command = self.commands.recv() => match Stop::from_command(command) {
                        Stop::Logout(done) => return self.finish(done),
                        Stop::Restart(done) => self.restart_idle(done),
                    }
                }
            }

            self.attempt += 1;
            self.set_state(SessionState::Connecting);
            let connector = Arc::clone(&self.context.connector);
            let url = self.context.config.gateway_url.clone();

            let connected = tokio::select! {
                result = connector.connect(&url) => result,
                command = self.commands.recv() => match Stop::from_command(command) {
                    Stop::Logout(done) => return self.finish(done),
                    Stop::Restart(done) => {
                        self.restart_idle(done);
                        delay = false;
                        continue;
                    }
                },
            };

            let transport = match connected {
                Ok(transport) => transport,
                Err(err) => {
                    warn!(error = %err, attempt = self.attempt, "gateway connect failed");
                    self.publish_lifecycle(
                        EventKind::ReconnectFail,
                        Payload::ReconnectFail {
                            attempt: self.attempt,
                        },
                    );
                    self.reconnecting = true;
                    delay = true;
                    continue;
                }
            };

            debug!("transport open");
            self.publish_lifecycle(EventKind::Connect, Payload::Empty);

            match self.drive(transport).await {
                Ended::Stopped(Stop::Logout(done)) => return self.finish(done),
                Ended::Stopped(Stop::Restart(done)) => {
                    let _ = done.send(());
                    delay = false;
                }
                Ended::Lost => delay = true,
            }
        }
    }

    /// Runs one connection until it is closed, lost or recycled.
    async fn drive(&mut self, mut transport: Box<dyn Transport>) -> Ended {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let stop = Stop::from_command(command);
                    self.shutdown(transport, stop.resumable()).await;
                    return Ended::Stopped(stop);
                }
                frame = transport.recv() => match frame {
                    Some(Ok(Frame::Text(text))) => {
                        if let Flow::Reconnect { resumable } = self.handle_frame(&text, transport.as_mut()).await {
                            self.recycle(transport, resumable).await;
                            return Ended::Lost;
                        }
                    }
                    Some(Ok(Frame::Close(info))) => {
                        let code = info.as_ref().map(|info| info.code);
                        let resumable = code.map_or(true, is_resumable_close);
                        if code.is_some_and(is_fatal_close) {
                            error!(code, reason = ?info.map(|info| info.reason), "gateway rejected session");
                        } else {
                            warn!(code, resumable, "gateway closed connection");
                        }
                        self.connection_lost(code, resumable);
                        return Ended::Lost;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "transport error");
                        self.connection_lost(None, true);
                        return Ended::Lost;
                    }
                    None => {
                        warn!("transport dropped without close frame");
                        self.connection_lost(None, true);
                        return Ended::Lost;
                    }
                },
                _ = next_tick(&mut self.heartbeat) => {
                    if let Flow::Reconnect { resumable } = self.beat(transport.as_mut()).await {
                        self.recycle(transport, resumable).await;
                        return Ended::Lost;
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, text: &str, transport: &mut dyn Transport) -> Flow {
        let inbound = match self.context.codec.decode(text) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(error = %err, "dropping malformed payload");
                return Flow::Continue;
            }
        };

        match inbound {
            Inbound::Hello { heartbeat_interval } => {
                self.start_heartbeat(heartbeat_interval);
                let resume = self.shared.resume.lock().clone();
                let sent = match &resume {
                    Some(context) => {
                        self.set_state(SessionState::Resuming);
                        debug!(session_id = %context.session_id, seq = context.last_sequence, "resuming");
                        let payload = Outbound::Resume {
                            token: self.options.token(),
                            context,
                        };
                        self.send(transport, payload).await
                    }
                    None => {
                        self.set_state(SessionState::Identifying);
                        debug!("identifying");
                        self.send(transport, Outbound::Identify(&self.options)).await
                    }
                };
                match sent {
                    Ok(()) => Flow::Continue,
                    Err(err) => {
                        warn!(error = %err, "could not send handshake");
                        Flow::Reconnect { resumable: true }
                    }
                }
            }
            Inbound::HeartbeatAck => {
                let mut heartbeat = self.shared.heartbeat.lock();
                heartbeat.record_ack(Instant::now());
                trace!(latency = ?heartbeat.response_time(), "heartbeat acknowledged");
                Flow::Continue
            }
            Inbound::HeartbeatRequest => self.heartbeat_now(transport).await,
            Inbound::Reconnect => {
                info!("gateway asked for a reconnect");
                Flow::Reconnect { resumable: true }
            }
            Inbound::InvalidSession { resumable } => {
                warn!(resumable, "session invalidated by gateway");
                Flow::Reconnect { resumable }
            }
            Inbound::Dispatch {
                sequence,
                name,
                data,
            } => {
                self.on_dispatch(sequence, &name, data);
                Flow::Continue
            }
        }
    }

    fn on_dispatch(&mut self, sequence: Option<u64>, name: &str, data: Value) {
        match name {
            "READY" => {
                match data.get("session_id").and_then(Value::as_str) {
                    Some(session_id) => {
                        *self.shared.resume.lock() = Some(ResumeContext {
                            session_id: Arc::from(session_id),
                            last_sequence: sequence.unwrap_or(0),
                        });
                    }
                    None => warn!("ready without session_id, session cannot be resumed"),
                }
                self.on_connected();
            }
            "RESUMED" => self.on_connected(),
            _ => (),
        }

        if let Some(sequence) = sequence {
            if let Some(resume) = self.shared.resume.lock().as_mut() {
                resume.last_sequence = resume.last_sequence.max(sequence);
            }
        }

        let event = Event::dispatch(
            name,
            Arc::clone(&self.context.config.gateway_name),
            self.options.shard(),
            self.session_id(),
            sequence,
            data,
        );
        self.context.dispatcher.publish(event);
    }

    fn on_connected(&mut self) {
        self.backoff.reset();
        let attempt = std::mem::take(&mut self.attempt);
        self.set_state(SessionState::Connected);
        info!(attempt, "shard connected");

        if std::mem::take(&mut self.reconnecting) {
            self.publish_lifecycle(EventKind::Reconnect, Payload::Reconnect { attempt });
        }
    }

    fn start_heartbeat(&mut self, interval: Duration) {
        let interval = interval.max(MIN_HEARTBEAT);
        self.shared.heartbeat.lock().start(interval);

        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(ticker);
    }

    async fn beat(&mut self, transport: &mut dyn Transport) -> Flow {
        let missed = self.shared.heartbeat.lock().check_missed();
        if missed >= self.context.config.missed_ack_threshold {
            warn!(missed, "heartbeats not acknowledged, recycling connection");
            return Flow::Reconnect { resumable: true };
        }
        self.heartbeat_now(transport).await
    }

    async fn heartbeat_now(&self, transport: &mut dyn Transport) -> Flow {
        let last_sequence = self
            .shared
            .resume
            .lock()
            .as_ref()
            .map(|resume| resume.last_sequence);
        self.shared.heartbeat.lock().record_sent(Instant::now());

        match self.send(transport, Outbound::Heartbeat { last_sequence }).await {
            Ok(()) => Flow::Continue,
            Err(err) => {
                warn!(error = %err, "could not send heartbeat");
                Flow::Reconnect { resumable: true }
            }
        }
    }

    async fn send(&self, transport: &mut dyn Transport, payload: Outbound<'_>) -> Result<(), SendError> {
        let frame = self.context.codec.encode(&payload)?;
        transport.send(frame).await?;
        Ok(())
    }

    /// Closes a connection we decided to give up on and marks it lost.
    async fn recycle(&mut self, transport: Box<dyn Transport>, resumable: bool) {
        let code = close_code(resumable);
        release(transport, code).await;
        self.connection_lost(Some(code), resumable);
    }

    fn connection_lost(&mut self, close_code: Option<u16>, resumable: bool) {
        self.stop_heartbeat();
        if !resumable {
            self.shared.resume.lock().take();
        }
        let was_connected = self.state() == SessionState::Connected;
        self.set_state(SessionState::Reconnecting);

        self.publish_lifecycle(
            EventKind::Disconnect,
            Payload::Disconnect {
                close_code,
                resumable,
            },
        );
        if was_connected {
            self.publish_lifecycle(EventKind::ReconnectStart, Payload::Empty);
        }
        self.reconnecting = true;
    }

    /// Requested close of a live connection.
    async fn shutdown(&mut self, transport: Box<dyn Transport>, resumable: bool) {
        let was_connected = self.state() == SessionState::Connected;
        self.set_state(SessionState::Closing);
        self.stop_heartbeat();

        let code = close_code(resumable);
        release(transport, code).await;

        if !resumable {
            self.shared.resume.lock().take();
        }
        self.set_state(SessionState::Disconnected);
        self.publish_lifecycle(
            EventKind::Disconnect,
            Payload::Disconnect {
                close_code: Some(code),
                resumable,
            },
        );
        if resumable && was_connected {
            self.publish_lifecycle(EventKind::ReconnectStart, Payload::Empty);
        }
        self.reconnecting = resumable;
    }

    /// Resumable close while no transport is open: skip the rest of the backoff.
    fn restart_idle(&mut self, done: oneshot::Sender<()>) {
        self.set_state(SessionState::Closing);
        self.set_state(SessionState::Disconnected);
        self.reconnecting = true;
        let _ = done.send(());
    }

    fn finish(self, done: Option<oneshot::Sender<()>>) {
        if self.state() != SessionState::Disconnected {
            self.set_state(SessionState::Closing);
        }
        self.shared.resume.lock().take();
        self.shared.heartbeat.lock().reset();
        self.set_state(SessionState::Disconnected);
        {
            let mut commands = self.shared.commands.lock();
            *commands = None;
            self.shared.notify_closed(self.options.shard_index());
        }
        info!("session closed");

        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn stop_heartbeat(&mut self) {
        self.heartbeat = None;
        self.shared.heartbeat.lock().reset();
    }

    fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "state change");
        }
    }

    fn session_id(&self) -> Option<Arc<str>> {
        self.shared
            .resume
            .lock()
            .as_ref()
            .map(|resume| Arc::clone(&resume.session_id))
    }

    fn publish_lifecycle(&self, kind: EventKind, payload: Payload) {
        let event = Event::lifecycle(
            kind,
            Arc::clone(&self.context.config.gateway_name),
            self.options.shard(),
            self.session_id(),
            payload,
        );
        self.context.dispatcher.publish(event);
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            let _ = ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Close the transport without depending on the peer being alive.
async fn release(mut transport: Box<dyn Transport>, code: u16) {
    match time::timeout(CLOSE_TIMEOUT, transport.close(code)).await {
        Ok(Ok(())) => (),
        Ok(Err(err)) => debug!(error = %err, "close handshake failed"),
        Err(_) => debug!("close handshake timed out"),
    }
}

fn close_code(resumable: bool) -> u16 {
    if resumable {
        RESUMABLE_CLOSE
    } else {
        NORMAL_CLOSE
    }
}

/// Authentication, sharding and intent rejections.
fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4010..=4014)
}

fn is_resumable_close(code: u16) -> bool {
    !(is_fatal_close(code) || matches!(code, 4007 | 4009))
}
