//! The session event loop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use parley_core::config::{BargeInMode, Config};
use parley_core::error::{ErrorKind, ParleyError, Result};
use parley_core::protocol::{
    self, ClientEvent, ConversationItem, FunctionTool, ServerEvent, SessionSettings, TurnDetection,
};
use parley_core::types::{AudioChunk, Epoch, EpochGate, SessionState, ToolDefinition};
use parley_media::{
    AudioSource, CaptureEvent, CapturePipeline, CaptureSpec, PlaybackConfig, PlaybackEvent,
    PlaybackPipeline, SinkFactory, SpeechDetector, VadTransition,
};
use parley_realtime::{InboundEvent, RealtimeTransport, TransportEvent};
use parley_tools::{CallOutcome, FunctionDispatch, ToolRegistry};

use crate::state::{self, Trigger};
use crate::turn::{RecentIds, TurnTracker};
use crate::{Command, SessionEvent, SessionHandle};

/// Answered call ids remembered for ignoring duplicate completions.
const ANSWERED_HISTORY: usize = 64;

/// Per-session behaviour.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub turn_detection: Option<TurnDetection>,
    pub barge_in: BargeInMode,
    pub vad_threshold: f64,
    pub vad_speech_frames: usize,
    /// Start capturing again once assistant audio has finished.
    pub resume_capture_after_playback: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            voice: None,
            instructions: None,
            turn_detection: None,
            barge_in: BargeInMode::Off,
            vad_threshold: 500.0,
            vad_speech_frames: 3,
            resume_capture_after_playback: false,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            voice: Some(config.voice()),
            instructions: config.instructions()?,
            turn_detection: config.turn_detection(),
            barge_in: config.barge_in(),
            vad_threshold: config.vad_threshold(),
            vad_speech_frames: config.vad_speech_frames(),
            resume_capture_after_playback: config.resume_capture_after_playback(),
        })
    }

    fn settings(&self, tools: &[ToolDefinition]) -> SessionSettings {
        SessionSettings {
            voice: self.voice.clone(),
            instructions: self.instructions.clone(),
            turn_detection: self.turn_detection.clone(),
            tools: tools.iter().map(FunctionTool::from).collect(),
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            ..SessionSettings::default()
        }
    }

    fn server_vad(&self) -> bool {
        self.turn_detection.is_some()
    }

    /// Whether the microphone stays open while the assistant speaks.
    fn listens_while_speaking(&self) -> bool {
        self.barge_in == BargeInMode::Vad || self.server_vad()
    }
}

/// Everything a session is assembled from.
///
/// `gate` must be the gate the transport stamps inbound events with.
pub struct SessionParts {
    pub transport: Box<dyn RealtimeTransport>,
    pub inbound: mpsc::UnboundedReceiver<InboundEvent>,
    pub gate: EpochGate,
    pub source: Box<dyn AudioSource>,
    pub capture: CaptureSpec,
    pub sinks: Arc<dyn SinkFactory>,
    pub playback: PlaybackConfig,
    pub tools: Arc<ToolRegistry>,
    pub options: SessionOptions,
}

/// One unit of work for the event loop.
#[derive(Debug)]
pub enum Input {
    Command(Command),
    Inbound(InboundEvent),
    /// The transport's inbound channel closed.
    InboundClosed,
    Capture(CaptureEvent),
    Playback(PlaybackEvent),
    Settled(CallOutcome),
}

pub struct Session {
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,

    transport: Box<dyn RealtimeTransport>,
    inbound: Option<mpsc::UnboundedReceiver<InboundEvent>>,
    configured: bool,
    closed: bool,

    capture: CapturePipeline,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    playback: PlaybackPipeline,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    vad: SpeechDetector,
    turn: TurnTracker,

    dispatch: FunctionDispatch,
    settled_tx: mpsc::UnboundedSender<CallOutcome>,
    settled_rx: mpsc::UnboundedReceiver<CallOutcome>,
    in_flight: HashMap<String, AbortHandle>,
    answered: RecentIds,

    options: SessionOptions,
}

impl Session {
    pub fn new(parts: SessionParts) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let SessionParts {
            transport,
            inbound,
            gate,
            source,
            capture,
            sinks,
            playback,
            tools,
            options,
        } = parts;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Initializing);
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();

        let vad = SpeechDetector::new(
            capture.format.sample_rate,
            options.vad_threshold,
            options.vad_speech_frames,
            // Silence length only matters for end-of-speech, which barge-in ignores
            10,
        );
        let (capture, capture_rx) = CapturePipeline::new(source, capture);
        let (playback, playback_rx) = PlaybackPipeline::new(sinks, playback, gate.clone());

        let session = Self {
            state: SessionState::Initializing,
            state_tx,
            events,
            commands,
            transport,
            inbound: Some(inbound),
            configured: false,
            closed: false,
            capture,
            capture_rx,
            playback,
            playback_rx,
            vad,
            turn: TurnTracker::new(gate),
            dispatch: FunctionDispatch::new(tools),
            settled_tx,
            settled_rx,
            in_flight: HashMap::new(),
            answered: RecentIds::new(ANSWERED_HISTORY),
            options,
        };
        (session, SessionHandle::new(command_tx, state_rx), events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run until disconnected.
    pub async fn run(mut self) {
        info!("Session loop started");
        while !self.state.is_terminal() {
            match self.next_input().await {
                Some(input) => self.handle(input).await,
                None => break,
            }
        }
        self.shutdown().await;
        info!("Session loop ended");
    }

    /// Wait for the next input from any source.
    pub async fn next_input(&mut self) -> Option<Input> {
        let inbound = &mut self.inbound;
        tokio::select! {
            command = self.commands.recv() => {
                // Every handle dropped: nobody can steer the session any more
                Some(Input::Command(command.unwrap_or(Command::Disconnect)))
            }
            event = recv_inbound(inbound) => Some(match event {
                Some(event) => Input::Inbound(event),
                None => Input::InboundClosed,
            }),
            Some(outcome) = self.settled_rx.recv() => Some(Input::Settled(outcome)),
            Some(event) = self.capture_rx.recv() => Some(Input::Capture(event)),
            Some(event) = self.playback_rx.recv() => Some(Input::Playback(event)),
            else => None,
        }
    }

    /// Process one input to completion.
    pub async fn handle(&mut self, input: Input) {
        if self.state.is_terminal() {
            return;
        }
        match input {
            Input::Command(command) => self.on_command(command).await,
            Input::Inbound(InboundEvent { epoch, event }) => self.on_transport(epoch, event),
            Input::InboundClosed => {
                self.inbound = None;
                self.fail(ParleyError::Transport("connection closed".into()));
            }
            Input::Capture(event) => self.on_capture(event),
            Input::Playback(event) => self.on_playback(event),
            Input::Settled(outcome) => self.on_settled(outcome),
        }
    }

    // --- State ---

    fn apply(&mut self, trigger: Trigger) -> bool {
        match state::next(self.state, trigger) {
            Some(to) => {
                let from = self.state;
                if from != to {
                    self.state = to;
                    info!(%from, %to, ?trigger, "Session state changed");
                    self.state_tx.send_replace(to);
                    self.emit(SessionEvent::StateChanged { from, to });
                }
                true
            }
            None => {
                debug!(state = %self.state, ?trigger, "Ignored trigger");
                false
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        warn!(?kind, %message, "Session error");
        self.emit(SessionEvent::Error { kind, message });
    }

    /// Report an error, release the devices, and enter `Error`.
    fn fail(&mut self, error: ParleyError) {
        self.report(error.kind(), error.to_string());
        self.capture.stop();
        self.playback.stop();
        self.apply(Trigger::Failure);
    }

    /// Queue an outbound event, failing the session when the transport refuses it.
    fn send(&mut self, event: ClientEvent) -> bool {
        let kind = event.kind();
        match self.transport.send(event) {
            Ok(()) => {
                trace!(kind, "Queued client event");
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    // --- Commands ---

    async fn on_command(&mut self, command: Command) {
        debug!(?command, state = %self.state, "Command");
        match command {
            Command::StartCapture if self.state == SessionState::Ready => {
                self.silence_trailing_audio();
                self.start_capture();
            }
            Command::StartCapture => debug!(state = %self.state, "Not ready to capture"),
            Command::StopCapture => self.stop_capture(),
            Command::Interrupt
                if self.state == SessionState::Ready && self.playback.is_playing() =>
            {
                self.silence_trailing_audio();
                self.start_capture();
            }
            Command::Interrupt => self.interrupt("command"),
            Command::Reset => {
                if self.apply(Trigger::Reset) {
                    self.dispatch.clear();
                    self.vad.reset();
                }
            }
            Command::Disconnect => {
                self.shutdown().await;
                self.apply(Trigger::Disconnect);
            }
        }
    }

    /// Stop audio still playing after its response finished.
    fn silence_trailing_audio(&mut self) {
        if self.playback.is_playing() {
            let epoch = self.turn.interrupt();
            self.playback.stop();
            info!(%epoch, "Silenced remaining assistant audio");
        }
    }

    fn start_capture(&mut self) {
        match self.capture.start() {
            Ok(()) => {
                self.apply(Trigger::StartCapture);
            }
            Err(e) => self.fail(e),
        }
    }

    /// End the user's turn: flush captured audio, commit it, request a response.
    fn stop_capture(&mut self) {
        if self.state != SessionState::Recording {
            debug!(state = %self.state, "Not recording");
            return;
        }
        self.capture.stop();

        let mut flushed = 0usize;
        while let Ok(event) = self.capture_rx.try_recv() {
            match event {
                CaptureEvent::Chunk(chunk) => {
                    if !self.send(ClientEvent::audio_append(chunk.as_bytes())) {
                        return;
                    }
                    flushed += 1;
                }
                CaptureEvent::Error(message) => {
                    self.fail(ParleyError::Device(format!("capture: {message}")));
                    return;
                }
            }
        }
        debug!(flushed, "Flushed captured audio");

        self.apply(Trigger::StopCapture);
        if self.send(ClientEvent::InputAudioBufferCommit) {
            self.send(ClientEvent::ResponseCreate);
        }
    }

    /// Barge-in while the assistant is speaking.
    fn interrupt(&mut self, source: &'static str) {
        if self.state != SessionState::AiSpeaking {
            debug!(state = %self.state, source, "Nothing to interrupt");
            return;
        }
        let cancelled = self.turn.response_id().map(str::to_string);
        let epoch = self.turn.interrupt();
        self.playback.stop();
        info!(%epoch, source, response_id = ?cancelled, "Assistant interrupted");

        if !self.send(ClientEvent::ResponseCancel) {
            return;
        }
        self.apply(Trigger::Interrupt);
        self.vad.reset();
        self.start_capture();
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.capture.cleanup();
        self.playback.cleanup();
        for (call_id, handle) in self.in_flight.drain() {
            debug!(%call_id, "Abandoning function call");
            handle.abort();
        }
        self.dispatch.clear();
        if let Err(e) = self.transport.close().await {
            warn!(%e, "Error closing realtime connection");
        }
    }

    // --- Transport ---

    fn on_transport(&mut self, epoch: Epoch, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.configured {
                    return;
                }
                self.configured = true;
                let tools = self.dispatch.definitions();
                info!(tools = tools.len(), "Connected, configuring session");
                let session = self.options.settings(&tools);
                if self.send(ClientEvent::SessionUpdate { session }) {
                    self.apply(Trigger::Opened);
                }
            }
            TransportEvent::Server(event) => self.on_server(epoch, event),
            TransportEvent::Malformed { raw, error } => {
                debug!(%raw, "Malformed frame");
                self.report(ErrorKind::Protocol, format!("malformed server event: {error}"));
            }
            TransportEvent::Closed { reason } => {
                let message = match reason {
                    Some(reason) => format!("connection closed: {reason}"),
                    None => "connection closed".to_string(),
                };
                self.fail(ParleyError::Transport(message));
            }
            TransportEvent::Failed(message) => self.fail(ParleyError::Transport(message)),
        }
    }

    fn on_server(&mut self, epoch: Epoch, event: ServerEvent) {
        trace!(kind = event.kind(), %epoch, "Server event");
        match event {
            ServerEvent::Error { error } => {
                let message = match &error.code {
                    Some(code) => format!("{} ({code})", error.message),
                    None => error.message.clone(),
                };
                warn!(event_id = ?error.event_id, kind = %error.kind, "Remote error");
                self.report(ErrorKind::Remote, message);
            }
            ServerEvent::SessionCreated { session } => {
                info!(id = ?session.id, model = ?session.model, "Realtime session created");
            }
            ServerEvent::SessionUpdated { .. } => debug!("Session configuration acknowledged"),
            ServerEvent::SpeechStarted { audio_start_ms, .. } => {
                debug!(?audio_start_ms, "Server detected speech");
                self.interrupt("server_vad");
            }
            ServerEvent::ConversationItemCreated { item } => self.on_item(item),
            ServerEvent::ResponseCreated { response } => {
                debug!(id = ?response.id, "Response started");
                self.turn.response_started(response.id.as_deref());
            }
            ServerEvent::AudioDelta {
                response_id, delta, ..
            } => self.on_audio(epoch, response_id.as_deref(), &delta),
            ServerEvent::AudioDone { response_id } => debug!(?response_id, "Audio stream done"),
            ServerEvent::AudioTranscriptDelta { response_id, delta } => {
                if response_id.as_deref().is_some_and(|id| self.turn.is_cancelled(id)) {
                    return;
                }
                self.emit(SessionEvent::Transcript { response_id, delta });
            }
            ServerEvent::FunctionCallArgumentsDelta {
                call_id,
                delta,
                name,
            } => {
                if self.dispatch.pending(&call_id).is_none() {
                    info!(%call_id, function = ?name, "Function call started");
                    self.emit(SessionEvent::FunctionCallStarted {
                        call_id: call_id.clone(),
                        name: name.clone(),
                    });
                }
                self.dispatch.on_delta(&call_id, &delta, name.as_deref());
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                arguments,
                name,
            } => self.on_function_done(call_id, &arguments, name),
            ServerEvent::ResponseDone { response } => {
                debug!(id = ?response.id, status = ?response.status, "Response done");
                self.turn.response_finished(response.id.as_deref());
                if !self.apply(Trigger::ResponseDone) {
                    return;
                }
                if self.capture.is_active() {
                    // Listening was only for barge-in
                    self.capture.stop();
                }
                // The finish estimate may have passed while still AiSpeaking
                if self.options.resume_capture_after_playback && !self.playback.is_playing() {
                    self.start_capture();
                }
            }
            ServerEvent::Unknown => {}
        }
    }

    fn on_item(&self, item: ConversationItem) {
        debug!(id = ?item.id, kind = %item.kind, role = ?item.role, "Conversation item");
        self.emit(SessionEvent::ConversationItem {
            text: item.text(),
            id: item.id,
            kind: item.kind,
            role: item.role,
            call_id: item.call_id,
        });
    }

    fn on_audio(&mut self, epoch: Epoch, response_id: Option<&str>, delta: &str) {
        use SessionState::*;
        if !matches!(self.state, Ready | Recording | AiSpeaking | ProcessingFunction) {
            debug!(state = %self.state, "Dropping audio outside a conversation");
            return;
        }
        if let Err(reason) = self.turn.check_audio(epoch, response_id) {
            debug!(?reason, %epoch, ?response_id, "Discarding stale audio");
            return;
        }
        let pcm = match protocol::decode_audio(delta) {
            Ok(pcm) => pcm,
            Err(e) => {
                self.report(ErrorKind::Protocol, format!("invalid audio payload: {e}"));
                return;
            }
        };
        if pcm.is_empty() {
            return;
        }

        if matches!(self.state, Ready | Recording) {
            self.begin_speaking();
        }
        if let Err(e) = self.playback.play(AudioChunk::pcm16(pcm), epoch) {
            self.fail(e);
        }
    }

    fn begin_speaking(&mut self) {
        if self.options.listens_while_speaking() {
            self.vad.reset();
            if let Err(e) = self.capture.start() {
                self.fail(e);
                return;
            }
        } else {
            self.capture.stop();
        }
        self.apply(Trigger::AudioAccepted);
    }

    // --- Devices ---

    fn on_capture(&mut self, event: CaptureEvent) {
        let chunk = match event {
            CaptureEvent::Chunk(chunk) => chunk,
            CaptureEvent::Error(message) => {
                self.fail(ParleyError::Device(format!("capture: {message}")));
                return;
            }
        };
        match self.state {
            SessionState::Recording => {
                self.send(ClientEvent::audio_append(chunk.as_bytes()));
            }
            SessionState::AiSpeaking => {
                if self.options.server_vad()
                    && !self.send(ClientEvent::audio_append(chunk.as_bytes()))
                {
                    return;
                }
                if self.options.barge_in == BargeInMode::Vad
                    && self.vad.process_chunk(&chunk) == Some(VadTransition::SpeechStarted)
                {
                    self.interrupt("local_vad");
                }
            }
            state => trace!(%state, len = chunk.len(), "Dropping captured audio"),
        }
    }

    fn on_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Finished => {
                debug!("Assistant audio finished");
                self.emit(SessionEvent::PlaybackFinished);
                if self.state == SessionState::Ready && self.options.resume_capture_after_playback {
                    self.start_capture();
                }
            }
            PlaybackEvent::Error(message) => {
                self.fail(ParleyError::Device(format!("playback: {message}")));
            }
        }
    }

    // --- Functions ---

    fn on_function_done(&mut self, call_id: String, arguments: &str, name: Option<String>) {
        if self.in_flight.contains_key(&call_id) || self.answered.contains(&call_id) {
            warn!(%call_id, "Duplicate completion for function call ignored");
            return;
        }
        if self.dispatch.pending(&call_id).is_none() {
            self.emit(SessionEvent::FunctionCallStarted {
                call_id: call_id.clone(),
                name: name.clone(),
            });
        }

        let call = self.dispatch.on_done(&call_id, arguments, name.as_deref());
        info!(%call_id, function = %call.name(), invoke = call.will_invoke(), "Function call complete");
        if self.apply(Trigger::FunctionCallDone) {
            self.capture.stop();
        }

        let settled = self.settled_tx.clone();
        let task = tokio::spawn(async move {
            let _ = settled.send(call.run().await);
        });
        self.in_flight.insert(call_id, task.abort_handle());
    }

    fn on_settled(&mut self, outcome: CallOutcome) {
        if self.in_flight.remove(&outcome.call_id).is_none() {
            debug!(call_id = %outcome.call_id, "Result for abandoned call dropped");
            return;
        }
        self.answered.insert(outcome.call_id.clone());
        info!(call_id = %outcome.call_id, function = %outcome.name, ok = outcome.ok, "Submitting function output");
        self.emit(SessionEvent::FunctionCompleted {
            call_id: outcome.call_id.clone(),
            name: outcome.name.clone(),
            output: outcome.output.clone(),
            ok: outcome.ok,
        });

        if !self.send(ClientEvent::function_output(&outcome.call_id, &outcome.output)) {
            return;
        }
        if !self.send(ClientEvent::ResponseCreate) {
            return;
        }
        if self.in_flight.is_empty() {
            self.apply(Trigger::FunctionsSettled);
        }
    }
}

async fn recv_inbound(
    rx: &mut Option<mpsc::UnboundedReceiver<InboundEvent>>,
) -> Option<InboundEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
