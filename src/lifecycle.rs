//! The loading lifecycle of a session.
//!
//! ```text
//! idle -> initializing -> loading_wasm -> loading_model -+-------------------------------+-> requesting_camera -> ready
//!                                                        |                               |
//!                                                        +-> waiting_for_file -+         |
//!                                                        |                     v         |
//!                                                        +-----------> loading_model_manual
//! ```
//!
//! Every state except `idle` can also move to `error`, which is terminal: the only way out is a
//! new session.

use std::{fmt, sync::Arc};

use tokio::sync::watch;

/// Where a session is in its loading lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Initializing,
    /// Resolving the inference runtime.
    LoadingWasm,
    /// Creating the engine from the configured model location.
    LoadingModel,
    /// The automatic model load failed; a manually supplied model file is needed.
    WaitingForFile,
    /// Creating the engine from a manually supplied model file.
    LoadingModelManual,
    RequestingCamera,
    /// Frames are being processed.
    Ready,
    Error,
}

impl LoadState {
    /// Whether the UI should block interaction with an overlay in this state.
    pub fn is_blocking(self) -> bool {
        !matches!(self, Self::Ready | Self::Error)
    }

    /// Whether frames are processed in this state.
    pub fn is_streaming(self) -> bool {
        self == Self::Ready
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Error
    }

    /// Whether the lifecycle may move from `self` to `to`.
    pub fn can_transition_to(self, to: LoadState) -> bool {
        use LoadState::*;

        match (self, to) {
            (Error, _) => false,
            (Idle, Error) => false,
            (_, Error) => true,
            (Idle, Initializing)
            | (Initializing, LoadingWasm)
            | (LoadingWasm, LoadingModel)
            | (LoadingModel, RequestingCamera)
            | (LoadingModel, WaitingForFile)
            | (LoadingModel, LoadingModelManual)
            | (WaitingForFile, LoadingModelManual)
            | (LoadingModelManual, RequestingCamera)
            | (RequestingCamera, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::LoadingWasm => "loading_wasm",
            Self::LoadingModel => "loading_model",
            Self::WaitingForFile => "waiting_for_file",
            Self::LoadingModelManual => "loading_model_manual",
            Self::RequestingCamera => "requesting_camera",
            Self::Ready => "ready",
            Self::Error => "error",
        })
    }
}

/// What the UI layer gets to see.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    pub state: LoadState,
    /// Set once the manual model upload has been offered. Stays set.
    pub manual_upload_offered: bool,
    /// The model error in `waiting_for_file`, the user-facing error in `error`.
    pub message: Option<String>,
}

/// An illegal lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: LoadState,
    pub to: LoadState,
}

/// The single owner of a session's [`Status`].
///
/// All changes go through the transition methods, which publish the new status to every
/// [`subscribe`](Self::subscribe)r. Clones share the same status, so the frame loop can fail the
/// session it belongs to.
#[derive(Clone)]
pub struct Lifecycle {
    status: Arc<watch::Sender<Status>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            status: Arc::new(watch::Sender::new(Status::default())),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn state(&self) -> LoadState {
        self.status.borrow().state
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Moves to `to`, clearing any message.
    pub fn advance(&self, to: LoadState) -> Result<(), InvalidTransition> {
        self.transition(to, None)
    }

    /// Moves to `waiting_for_file`, exposing the automatic load's error message. Also offers the
    /// manual upload.
    pub fn await_file(&self, message: String) -> Result<(), InvalidTransition> {
        self.transition(LoadState::WaitingForFile, Some(message))?;
        self.offer_manual_upload();
        Ok(())
    }

    /// Moves to the terminal `error` state with a user-facing message.
    ///
    /// A lifecycle that is still `idle` or has already failed is left untouched, so the first
    /// failure's message is the one that stays.
    pub fn fail(&self, message: String) -> Result<(), InvalidTransition> {
        self.transition(LoadState::Error, Some(message))
    }

    /// Shows the manual model upload affordance.
    pub fn offer_manual_upload(&self) {
        self.status.send_if_modified(|status| {
            let changed = !status.manual_upload_offered;
            status.manual_upload_offered = true;
            changed
        });
        log::debug!("manual model upload offered");
    }

    pub fn manual_upload_offered(&self) -> bool {
        self.status.borrow().manual_upload_offered
    }

    fn transition(&self, to: LoadState, message: Option<String>) -> Result<(), InvalidTransition> {
        let mut result = Ok(());
        self.status.send_if_modified(|status| {
            let from = status.state;
            if !from.can_transition_to(to) {
                result = Err(InvalidTransition { from, to });
                return false;
            }

            match &message {
                Some(message) => log::debug!("lifecycle: {from} -> {to} ({message})"),
                None => log::debug!("lifecycle: {from} -> {to}"),
            }
            status.state = to;
            status.message = message;
            true
        });
        result
    }
}
