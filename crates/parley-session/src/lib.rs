//! Voice session orchestration.
//!
//! A [`Session`] owns the state machine and runs one event loop that
//! multiplexes user commands, realtime transport events, captured audio,
//! playback notifications, and settled function calls. Everything else is
//! state-ignorant and talks to it through channels. The loop is driven by
//! [`Session::run`]; callers steer it with a [`SessionHandle`] and observe it
//! through [`SessionEvent`]s.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use parley_core::error::{ErrorKind, ParleyError, Result};
use parley_core::types::SessionState;

pub mod orchestrator;
pub mod state;
pub mod turn;

pub use orchestrator::{Input, Session, SessionOptions, SessionParts};

/// Events emitted by a session while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },

    /// Transcript text of the assistant's speech as it streams in.
    Transcript { response_id: Option<String>, delta: String },

    /// A conversation item the service created.
    ConversationItem {
        id: Option<String>,
        kind: String,
        role: Option<String>,
        call_id: Option<String>,
        text: Option<String>,
    },

    /// The assistant began streaming a function call.
    FunctionCallStarted { call_id: String, name: Option<String> },

    /// A function call produced its output.
    FunctionCompleted {
        call_id: String,
        name: String,
        output: serde_json::Value,
        ok: bool,
    },

    /// The estimated end of assistant audio was reached.
    PlaybackFinished,

    Error { kind: ErrorKind, message: String },
}

/// Requests accepted by a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartCapture,
    /// Stop capturing, commit the audio, and ask for a response.
    StopCapture,
    /// Cut the assistant off and start listening.
    Interrupt,
    /// Leave the error state.
    Reset,
    Disconnect,
}

/// Cloneable control surface for a running [`Session`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        state: watch::Receiver<SessionState>,
    ) -> Self {
        Self { commands, state }
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ParleyError::Session("session has ended".into()))
    }

    pub fn start_capture(&self) -> Result<()> {
        self.send(Command::StartCapture)
    }

    pub fn stop_capture(&self) -> Result<()> {
        self.send(Command::StopCapture)
    }

    pub fn interrupt(&self) -> Result<()> {
        self.send(Command::Interrupt)
    }

    pub fn reset(&self) -> Result<()> {
        self.send(Command::Reset)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for(&self, target: SessionState) -> Result<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| ParleyError::Session("session has ended".into()))
    }
}
