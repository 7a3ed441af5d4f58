//! Session orchestrator: the single event loop that takes a user from
//! registration to a live peer-to-peer call and back.
//!
//! Every user intent, channel message, async outcome and negotiation event is
//! an [`Input`] on one queue, handled one at a time by a task that owns all
//! session state. Results of async work carry the identity of the session
//! generation, channel or peer that requested them; stale ones are dropped.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, MediaError, RegisterError, Result};
use crate::matching::{MatchingChannel, MatchingClient};
use crate::media::{LocalStream, MediaSource, RemoteStream};
use crate::models::{MatchingEvent, RegisterStatus, SignalingEvent};
use crate::peer::{NegotiationEvent, NegotiatorFactory, PeerController, PeerRoute};
use crate::session::{
    ChatLog, ChatMessage, Role, RoomBinding, SessionSnapshot, SessionState,
};
use crate::signaling::{Delivery, SignalingChannel};
use crate::ws::WsUpdate;

/// Importance of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Human-readable notification for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: Severity,
    pub title: String,
    pub description: String,
}

/// Push updates for the presentation layer
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Notice(Notice),
    /// Local preview became available
    LocalStream(LocalStream),
    /// Attach to the remote media sink
    RemoteStream(RemoteStream),
    /// Both media sinks should be detached
    StreamsCleared,
}

/// Read-only side of a running session
pub struct SessionUpdates {
    pub snapshot: watch::Receiver<SessionSnapshot>,
    pub updates: mpsc::UnboundedReceiver<SessionUpdate>,
}

enum Command {
    Register(String),
    SendChat(String),
    Skip,
    FindNext,
    Teardown,
    Shutdown(oneshot::Sender<()>),
}

/// First inbound signal for a responder, used to build its controller
struct FirstSignal {
    room_code: Option<String>,
    from: Option<String>,
    data: Value,
}

enum Input {
    Command(Command),
    Matching {
        channel: u64,
        update: WsUpdate<MatchingEvent>,
    },
    Signaling {
        channel: u64,
        update: WsUpdate<SignalingEvent>,
    },
    Registered {
        attempt: u64,
        outcome: std::result::Result<RegisterStatus, RegisterError>,
    },
    MediaReady {
        generation: u64,
        outcome: std::result::Result<LocalStream, MediaError>,
    },
    ReadyTimeout {
        generation: u64,
    },
    Peer {
        controller: u64,
        event: NegotiationEvent,
    },
}

/// User intents for a running session
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<Input>,
}

impl SessionHandle {
    /// Register `name` with the matching service. Fails fast on an empty name.
    pub fn register(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::EmptyName);
        }
        self.command(Command::Register(name.to_string()))
    }

    /// Send a chat line to the peer; ignored unless connected
    pub fn send_chat(&self, text: &str) -> Result<()> {
        self.command(Command::SendChat(text.to_string()))
    }

    /// End the current call and search again. The caller confirms first.
    pub fn skip(&self) -> Result<()> {
        self.command(Command::Skip)
    }

    /// Search again after the peer left
    pub fn find_next(&self) -> Result<()> {
        self.command(Command::FindNext)
    }

    /// Release the current call's resources without searching again
    pub fn teardown(&self) -> Result<()> {
        self.command(Command::Teardown)
    }

    /// Tear down, close the matching channel and stop the event loop
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Shutdown(tx))?;
        rx.await.map_err(|_| Error::Stopped)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inputs
            .send(Input::Command(command))
            .map_err(|_| Error::Stopped)
    }
}

/// Start a session orchestrator on the current tokio runtime
pub fn spawn(
    config: Config,
    media: Arc<dyn MediaSource>,
    negotiators: Arc<dyn NegotiatorFactory>,
) -> Result<(SessionHandle, SessionUpdates)> {
    let matching_client = MatchingClient::new(&config)?;
    let (inputs, inputs_rx) = mpsc::unbounded_channel();
    let (updates, updates_rx) = mpsc::unbounded_channel();
    let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot::default());

    let orchestrator = Orchestrator {
        config,
        matching_client,
        media,
        negotiators,
        inputs: inputs.clone(),
        updates,
        snapshot,
        state: SessionState::Idle,
        display_name: None,
        registered: false,
        pending_registration: false,
        registration_attempt: 0,
        matching: None,
        signaling: None,
        binding: None,
        local_stream: None,
        remote_stream: None,
        controller: None,
        chat: ChatLog::default(),
        generation: 0,
        setup_cancel: None,
        ready_wait: None,
        next_id: 0,
    };
    tokio::spawn(orchestrator.run(inputs_rx));

    Ok((
        SessionHandle { inputs },
        SessionUpdates {
            snapshot: snapshot_rx,
            updates: updates_rx,
        },
    ))
}

struct Orchestrator {
    config: Config,
    matching_client: MatchingClient,
    media: Arc<dyn MediaSource>,
    negotiators: Arc<dyn NegotiatorFactory>,
    inputs: mpsc::UnboundedSender<Input>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    snapshot: watch::Sender<SessionSnapshot>,

    state: SessionState,
    display_name: Option<String>,
    registered: bool,
    /// Registration waits for the matching channel to open
    pending_registration: bool,
    registration_attempt: u64,
    matching: Option<MatchingChannel>,
    signaling: Option<SignalingChannel>,
    binding: Option<RoomBinding>,
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    controller: Option<PeerController>,
    chat: ChatLog,
    /// Bumped per setup sequence and per teardown
    generation: u64,
    setup_cancel: Option<CancellationToken>,
    ready_wait: Option<CancellationToken>,
    next_id: u64,
}

impl Orchestrator {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        info!("Session orchestrator started");
        while let Some(input) = inputs.recv().await {
            let stop = self.handle(input).await;
            self.publish();
            if stop {
                break;
            }
        }
        info!("Session orchestrator stopped");
    }

    async fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Command(command) => return self.on_command(command).await,
            Input::Matching { channel, update } => self.on_matching(channel, update).await,
            Input::Signaling { channel, update } => self.on_signaling(channel, update).await,
            Input::Registered { attempt, outcome } => self.on_registered(attempt, outcome),
            Input::MediaReady {
                generation,
                outcome,
            } => self.on_media_ready(generation, outcome).await,
            Input::ReadyTimeout { generation } => self.on_ready_timeout(generation),
            Input::Peer { controller, event } => self.on_peer_event(controller, event).await,
        }
        false
    }

    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Register(name) => self.register(name),
            Command::SendChat(text) => self.send_chat(&text),
            Command::Skip => {
                info!("User skipped the current peer");
                self.restart_matching().await;
            }
            Command::FindNext => {
                info!("Looking for the next match");
                self.restart_matching().await;
            }
            Command::Teardown => {
                self.teardown().await;
                if self.state.in_call_setup() {
                    self.state = SessionState::Idle;
                }
            }
            Command::Shutdown(ack) => {
                self.teardown().await;
                if let Some(channel) = self.matching.take() {
                    channel.close();
                }
                self.pending_registration = false;
                self.state = SessionState::Idle;
                self.publish();
                let _ = ack.send(());
                return true;
            }
        }
        false
    }

    // ---------------------------------------------------------------------
    // Registration

    fn register(&mut self, name: String) {
        if self.registered {
            warn!(
                "Already registered as {:?}; use skip or find-next to search again",
                self.display_name
            );
            return;
        }
        info!("Registering as {}", name);
        self.display_name = Some(name);
        self.state = SessionState::Registering;
        self.start_registration();
    }

    /// Make sure the matching channel is open, then request registration
    fn start_registration(&mut self) {
        let Some(name) = self.display_name.clone() else {
            return;
        };

        if !self.ensure_matching(&name) {
            self.registration_failed("could not open matching channel".into());
            return;
        }

        match &self.matching {
            Some(channel) if channel.is_open() => self.request_registration(name),
            _ => {
                debug!("Registration for {} waits for the matching channel", name);
                self.pending_registration = true;
            }
        }
    }

    fn ensure_matching(&mut self, name: &str) -> bool {
        if let Some(channel) = &self.matching {
            if channel.name() == name {
                return true;
            }
        }
        if let Some(stale) = self.matching.take() {
            stale.close();
        }

        let url = match self.config.matching_endpoint(name) {
            Ok(url) => url,
            Err(e) => {
                error!("Invalid matching endpoint: {}", e);
                return false;
            }
        };

        let id = self.next_id();
        let inputs = self.inputs.clone();
        self.matching = Some(MatchingChannel::open(url, id, name, move |update| {
            let _ = inputs.send(Input::Matching {
                channel: id,
                update,
            });
        }));
        true
    }

    fn request_registration(&mut self, name: String) {
        self.pending_registration = false;
        self.registration_attempt += 1;
        let attempt = self.registration_attempt;
        let client = self.matching_client.clone();
        let inputs = self.inputs.clone();
        debug!("Registration attempt {} for {}", attempt, name);
        tokio::spawn(async move {
            let outcome = client.register(&name).await;
            let _ = inputs.send(Input::Registered { attempt, outcome });
        });
    }

    fn on_registered(
        &mut self,
        attempt: u64,
        outcome: std::result::Result<RegisterStatus, RegisterError>,
    ) {
        if attempt != self.registration_attempt {
            debug!("Ignoring stale registration outcome {}", attempt);
            return;
        }
        let searching = self.state.is_waiting_for_match();

        match outcome {
            Ok(RegisterStatus::Queued) => {
                self.registered = true;
                if searching {
                    self.state = SessionState::Queued;
                }
                self.notify(
                    Severity::Info,
                    "You're in the queue!",
                    "Looking for someone to match with...",
                );
            }
            Ok(RegisterStatus::Exists) if self.registered => {
                // Still waiting in the queue from an earlier registration
                if searching {
                    self.state = SessionState::Queued;
                }
            }
            Ok(RegisterStatus::Exists) => {
                warn!("Display name {:?} already in use", self.display_name);
                if searching {
                    self.state = SessionState::Idle;
                }
                self.notify(
                    Severity::Error,
                    "Username already exists",
                    "Please choose a different username.",
                );
            }
            Ok(RegisterStatus::Rejected(status)) => {
                warn!("Registration rejected with status {}", status);
                if searching {
                    self.state = SessionState::Idle;
                }
                self.notify(
                    Severity::Error,
                    "Internal server error",
                    "Please try again later.",
                );
            }
            Err(e) => self.registration_failed(e.to_string()),
        }
    }

    fn registration_failed(&mut self, reason: String) {
        error!("Registration failed: {}", reason);
        self.pending_registration = false;
        self.state = SessionState::RegisterFailed;
        self.notify(
            Severity::Error,
            "Connection failed",
            "Could not connect to matching service. Make sure it's running.",
        );
    }

    // ---------------------------------------------------------------------
    // Matching channel

    async fn on_matching(&mut self, channel: u64, update: WsUpdate<MatchingEvent>) {
        if self.matching.as_ref().map(MatchingChannel::id) != Some(channel) {
            debug!("Ignoring update from stale matching channel {}", channel);
            return;
        }

        match update {
            WsUpdate::Opened => {
                if let Some(matching) = self.matching.as_mut() {
                    matching.mark_open();
                }
                if self.pending_registration {
                    if let Some(name) = self.display_name.clone() {
                        self.request_registration(name);
                    }
                }
            }
            WsUpdate::Failed(reason) => {
                self.matching = None;
                if self.pending_registration {
                    self.registration_failed(reason);
                } else {
                    self.matching_lost(Some(reason));
                }
            }
            WsUpdate::Closed(reason) => {
                self.matching = None;
                if self.pending_registration {
                    self.registration_failed(reason.unwrap_or_else(|| "channel closed".into()));
                } else {
                    self.matching_lost(reason);
                }
            }
            WsUpdate::Message(event) => self.on_matching_event(event).await,
        }
    }

    fn matching_lost(&mut self, reason: Option<String>) {
        warn!("Matching channel closed: {:?}", reason);
        if self.state.is_waiting_for_match() || self.state == SessionState::Idle {
            self.state = SessionState::MatchingDisconnected;
        }
        self.notify(
            Severity::Warning,
            "Matching service disconnected",
            reason.as_deref().unwrap_or("The matching connection was closed"),
        );
    }

    async fn on_matching_event(&mut self, event: MatchingEvent) {
        match event {
            MatchingEvent::Matched {
                room_code,
                initiator,
            } => self.on_matched(room_code, initiator),
            MatchingEvent::Chat {
                sender,
                message,
                timestamp,
            } => {
                let from_peer = self
                    .binding
                    .as_ref()
                    .is_some_and(|binding| binding.peer_name == sender);
                if from_peer {
                    debug!("Chat from {}: {}", sender, message);
                    self.chat
                        .push(ChatMessage::from_peer(sender, message, timestamp));
                } else {
                    debug!("Dropping chat from {} outside the current room", sender);
                }
            }
            MatchingEvent::PeerDisconnected { message } => self.peer_left(message).await,
            MatchingEvent::Unknown => debug!("Ignoring unknown matching event"),
        }
    }

    fn on_matched(&mut self, room_code: String, initiator: bool) {
        if let Some(current) = &self.binding {
            warn!(
                "Ignoring match for room {} while bound to {}",
                room_code, current.room_code
            );
            return;
        }
        let Some(name) = self.display_name.clone() else {
            warn!("Ignoring match for room {} before registration", room_code);
            return;
        };

        let binding = RoomBinding::from_match(&room_code, &name, initiator);
        info!(
            "Matched with {} in room {} as {}",
            binding.peer_name, binding.room_code, binding.role
        );
        self.notify(
            Severity::Info,
            "Matched!",
            &format!("Room: {}, Role: {}", binding.room_code, binding.role),
        );

        self.registered = true;
        self.binding = Some(binding);
        self.state = SessionState::Matched;
        self.begin_setup();
    }

    // ---------------------------------------------------------------------
    // Setup sequence: media -> signaling -> join -> peer

    fn begin_setup(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.setup_cancel = Some(cancel.clone());
        self.state = SessionState::AcquiringMedia;
        self.notify(
            Severity::Info,
            "Requesting media",
            "Asking for camera/mic access...",
        );

        let media = self.media.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Media acquisition for setup {} cancelled", generation);
                }
                outcome = media.acquire() => {
                    let _ = inputs.send(Input::MediaReady { generation, outcome });
                }
            }
        });
    }

    async fn on_media_ready(
        &mut self,
        generation: u64,
        outcome: std::result::Result<LocalStream, MediaError>,
    ) {
        let current = generation == self.generation
            && self.binding.is_some()
            && self.state == SessionState::AcquiringMedia;
        if !current {
            if let Ok(stream) = outcome {
                let stopped = stream.stop();
                debug!(
                    "Stopped {} tracks from stale media acquisition {}",
                    stopped, generation
                );
            }
            return;
        }

        match outcome {
            Ok(stream) => {
                info!("Local media acquired ({} tracks)", stream.tracks().len());
                self.local_stream = Some(stream.clone());
                self.push(SessionUpdate::LocalStream(stream));
                self.notify(Severity::Info, "Media acquired", "Camera and mic ready");
                self.join_signaling().await;
            }
            Err(e) => {
                error!("Media acquisition failed: {}", e);
                self.state = SessionState::MediaDenied;
                self.notify(
                    Severity::Error,
                    "Camera/Mic denied",
                    "Please allow access to your camera and microphone",
                );
            }
        }
    }

    async fn join_signaling(&mut self) {
        self.state = SessionState::JoiningSignaling;
        let Some(name) = self.display_name.clone() else {
            return;
        };

        // At most one signaling channel per client
        match self.signaling.as_ref().map(SignalingChannel::is_open) {
            Some(true) => {
                self.send_join().await;
                return;
            }
            Some(false) => {}
            None => {
                let url = match self.config.signaling_endpoint(&name) {
                    Ok(url) => url,
                    Err(e) => {
                        self.signaling_failed(e.to_string());
                        return;
                    }
                };
                let id = self.next_id();
                let inputs = self.inputs.clone();
                self.signaling = Some(SignalingChannel::open(url, id, move |update| {
                    let _ = inputs.send(Input::Signaling {
                        channel: id,
                        update,
                    });
                }));
            }
        }

        // Wait for the open event, or give up after the timeout
        let Some(setup) = &self.setup_cancel else {
            return;
        };
        let wait = setup.child_token();
        self.ready_wait = Some(wait.clone());
        let generation = self.generation;
        let timeout = self.config.ready_timeout;
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = inputs.send(Input::ReadyTimeout { generation });
                }
            }
        });
    }

    fn on_ready_timeout(&mut self, generation: u64) {
        if generation != self.generation || self.state != SessionState::JoiningSignaling {
            return;
        }
        self.ready_wait = None;
        if let Some(channel) = self.signaling.take() {
            channel.close();
        }
        self.signaling_failed("signaling channel not ready".into());
    }

    async fn send_join(&mut self) {
        let (Some(binding), Some(channel)) = (self.binding.clone(), self.signaling.as_ref()) else {
            return;
        };

        if let Err(e) = channel.join(&binding) {
            self.signaling_failed(e.to_string());
            return;
        }
        info!(
            "Sent join for room {} as {}",
            binding.room_code, binding.role
        );
        self.notify(
            Severity::Info,
            "Joining room",
            &format!("Sending join event as {}", binding.role),
        );
        self.state = SessionState::Negotiating;

        if binding.role == Role::Initiator {
            self.start_controller(None).await;
        } else {
            debug!("Responder waiting for the initiator's offer");
        }
    }

    // ---------------------------------------------------------------------
    // Signaling channel

    async fn on_signaling(&mut self, channel: u64, update: WsUpdate<SignalingEvent>) {
        if self.signaling.as_ref().map(SignalingChannel::id) != Some(channel) {
            debug!("Ignoring update from stale signaling channel {}", channel);
            return;
        }

        match update {
            WsUpdate::Opened => {
                if let Some(signaling) = self.signaling.as_mut() {
                    signaling.mark_open();
                }
                if let Some(wait) = self.ready_wait.take() {
                    wait.cancel();
                }
                if self.state == SessionState::JoiningSignaling {
                    self.send_join().await;
                }
            }
            WsUpdate::Failed(reason) => {
                self.signaling = None;
                self.signaling_lost(reason);
            }
            WsUpdate::Closed(reason) => {
                self.signaling = None;
                self.signaling_lost(reason.unwrap_or_else(|| "signaling channel closed".into()));
            }
            WsUpdate::Message(event) => self.on_signaling_event(event).await,
        }
    }

    fn signaling_lost(&mut self, reason: String) {
        if let Some(wait) = self.ready_wait.take() {
            wait.cancel();
        }
        if self.state == SessionState::Connected {
            warn!("Signaling channel lost during call: {}", reason);
            self.notify(Severity::Warning, "Signaling closed", &reason);
        } else if self.state.in_call_setup() {
            self.signaling_failed(reason);
        } else {
            debug!("Signaling channel closed: {}", reason);
        }
    }

    fn signaling_failed(&mut self, reason: String) {
        error!("Signaling failure: {}", reason);
        self.state = SessionState::ChannelError(reason.clone());
        self.notify(Severity::Error, "Signaling error", &reason);
    }

    async fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Verified { room_code, role } => {
                debug!("Signaling verified for {:?} as {:?}", room_code, role);
                let Some(channel) = self.signaling.as_mut() else {
                    return;
                };
                match channel.mark_verified() {
                    Ok(flushed) => info!("Signaling verified, {} queued signals sent", flushed),
                    Err(e) => self.signaling_failed(e.to_string()),
                }
            }
            SignalingEvent::Signal {
                room_code,
                from,
                data,
            } => {
                self.on_inbound_signal(FirstSignal {
                    room_code,
                    from,
                    data,
                })
                .await
            }
            SignalingEvent::Error { message } => {
                let message = message.unwrap_or_else(|| "unknown".into());
                error!("Signaling error: {}", message);
                self.state = SessionState::ChannelError(message.clone());
                self.notify(Severity::Error, "Signaling error", &message);
            }
            SignalingEvent::PeerDisconnected { message } => self.peer_left(message).await,
            SignalingEvent::Unknown => debug!("Ignoring unknown signaling event"),
        }
    }

    async fn on_inbound_signal(&mut self, signal: FirstSignal) {
        if self.controller.is_some() {
            self.feed_controller(signal.data).await;
            return;
        }

        let responder = self
            .binding
            .as_ref()
            .is_some_and(|binding| binding.role == Role::Responder);
        if responder && self.local_stream.is_some() {
            info!("First signal received, creating responder peer");
            self.start_controller(Some(signal)).await;
        } else {
            warn!("Dropping signal: no peer yet (binding {:?})", self.binding);
        }
    }

    // ---------------------------------------------------------------------
    // Peer negotiation

    async fn start_controller(&mut self, first: Option<FirstSignal>) {
        if self.controller.is_some() {
            warn!("Peer already exists; not creating another");
            return;
        }
        let (Some(binding), Some(stream)) = (self.binding.clone(), self.local_stream.clone())
        else {
            warn!("Cannot create peer without a room binding and local stream");
            return;
        };

        let (route, first_data) = match first {
            Some(signal) => (
                PeerRoute {
                    room_code: signal.room_code.unwrap_or(binding.room_code),
                    target: signal.from.unwrap_or(binding.peer_name),
                    local_name: binding.local_name,
                },
                Some(signal.data),
            ),
            None => (
                PeerRoute {
                    room_code: binding.room_code,
                    target: binding.peer_name,
                    local_name: binding.local_name,
                },
                None,
            ),
        };

        let id = self.next_id();
        let inputs = self.inputs.clone();
        let started = PeerController::start(
            id,
            binding.role,
            stream,
            route,
            self.negotiators.as_ref(),
            &self.config.ice_servers,
            move |controller, event| {
                let _ = inputs.send(Input::Peer { controller, event });
            },
        )
        .await;

        match started {
            Ok(controller) => {
                self.controller = Some(controller);
                if let Some(data) = first_data {
                    self.feed_controller(data).await;
                }
            }
            Err(e) => self.negotiation_failed(e.to_string()),
        }
    }

    async fn feed_controller(&mut self, data: Value) {
        let Some(controller) = &self.controller else {
            return;
        };
        if let Err(e) = controller.feed(data).await {
            self.negotiation_failed(e.to_string());
        }
    }

    fn negotiation_failed(&mut self, reason: String) {
        error!("Peer error: {}", reason);
        self.state = SessionState::NegotiationError(reason.clone());
        self.notify(Severity::Error, "Peer error", &reason);
    }

    async fn on_peer_event(&mut self, controller: u64, event: NegotiationEvent) {
        let Some(current) = &self.controller else {
            debug!("Ignoring event from destroyed peer {}", controller);
            return;
        };
        if current.id() != controller {
            debug!("Ignoring event from stale peer {}", controller);
            return;
        }

        match event {
            NegotiationEvent::Signal(data) => {
                let envelope = current.envelope_for(data);
                match self.signaling.as_mut() {
                    Some(channel) => match channel.send(envelope) {
                        Ok(Delivery::Sent) => {}
                        Ok(Delivery::Queued) => debug!("Signal held until verification"),
                        Err(e) => warn!("Failed to send signal: {}", e),
                    },
                    None => warn!("No signaling channel; dropping outbound signal"),
                }
            }
            NegotiationEvent::Stream(stream) => {
                info!("Received remote stream {}", stream.id());
                self.remote_stream = Some(stream.clone());
                self.push(SessionUpdate::RemoteStream(stream));
            }
            NegotiationEvent::Connect => {
                let peer = current.route().target.clone();
                info!("Connected with {}", peer);
                self.state = SessionState::Connected;
                self.notify(
                    Severity::Success,
                    "Connected!",
                    &format!("You are now connected with {}", peer),
                );
            }
            NegotiationEvent::Error(reason) => self.negotiation_failed(reason),
            NegotiationEvent::Close => {
                info!("Connection closed by peer");
                self.peer_left(None).await;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Teardown and restart

    async fn peer_left(&mut self, message: Option<String>) {
        if self.binding.is_none() {
            debug!("Peer-left notice with no active room");
            return;
        }
        info!("Peer disconnected: {:?}", message);
        self.teardown().await;
        self.state = SessionState::PeerDisconnected;
        self.notify(
            Severity::Warning,
            "Peer left",
            message.as_deref().unwrap_or("The other person has left"),
        );
    }

    async fn restart_matching(&mut self) {
        if self.display_name.is_none() {
            warn!("Cannot search for a match before registering");
            return;
        }
        self.chat.clear();
        self.teardown().await;
        self.state = SessionState::Searching;
        self.notify(Severity::Info, "Searching", "Looking for a new match...");
        self.start_registration();
    }

    /// Release everything tied to the current room. Safe to repeat.
    async fn teardown(&mut self) {
        let live = self.binding.is_some()
            || self.controller.is_some()
            || self.local_stream.is_some()
            || self.remote_stream.is_some()
            || self.signaling.is_some()
            || self.setup_cancel.is_some()
            || !self.chat.is_empty();
        if !live {
            return;
        }

        self.generation += 1;
        if let Some(cancel) = self.setup_cancel.take() {
            cancel.cancel();
        }
        self.ready_wait = None;

        if let Some(mut controller) = self.controller.take() {
            controller.destroy().await;
        }
        if let Some(stream) = self.local_stream.take() {
            let stopped = stream.stop();
            info!("Stopped {} local tracks", stopped);
        }
        self.remote_stream = None;
        if let Some(channel) = self.signaling.take() {
            channel.close();
        }
        self.binding = None;
        self.chat.clear();
        self.push(SessionUpdate::StreamsCleared);
        info!("Session torn down");
    }

    // ---------------------------------------------------------------------
    // Chat

    fn send_chat(&mut self, text: &str) {
        let body = text.trim();
        if body.is_empty() {
            return;
        }
        if self.state != SessionState::Connected {
            debug!("Chat ignored while {}", self.state);
            return;
        }
        let (Some(binding), Some(channel)) = (&self.binding, &self.matching) else {
            debug!("Chat ignored without a room or matching channel");
            return;
        };
        if binding.peer_name.is_empty() || !channel.is_open() {
            debug!("Chat ignored: peer unknown or matching channel not open");
            return;
        }

        self.chat
            .push(ChatMessage::own(binding.local_name.clone(), body));
        if let Err(e) = channel.send_chat(&binding.peer_name, body) {
            warn!("Failed to send chat: {}", e);
        } else {
            debug!("Sent chat to {}", binding.peer_name);
        }
    }

    // ---------------------------------------------------------------------
    // Output

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn push(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn notify(&self, severity: Severity, title: &str, description: &str) {
        self.push(SessionUpdate::Notice(Notice {
            severity,
            title: title.to_string(),
            description: description.to_string(),
        }));
    }

    fn publish(&self) {
        let next = SessionSnapshot {
            status: self.state.to_string(),
            display_name: self.display_name.clone(),
            registered: self.registered,
            matching_connected: self.matching.as_ref().is_some_and(MatchingChannel::is_open),
            room_code: self.binding.as_ref().map(|b| b.room_code.clone()),
            peer_name: self.binding.as_ref().map(|b| b.peer_name.clone()),
            role: self.binding.as_ref().map(|b| b.role),
            chat: self.chat.messages().to_vec(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
