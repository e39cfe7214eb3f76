//! One start/stop cycle of gesture tracking.

use tokio::sync::watch;

use crate::{
    config::Config,
    hand::gesture::{GestureClassifier, GestureSignal},
    lifecycle::{Lifecycle, LoadState, Status},
    loader::{AssetLoader, UploadHandle},
    nn::RuntimeResolver,
    scheduler::FrameScheduler,
    video::CaptureSource,
    Error,
};

/// Loads the model, opens the camera and runs the frame loop.
///
/// A session goes through its [`LoadState`] lifecycle once. After a failure or a [`stop`], a new
/// session has to be created to start over.
///
/// [`stop`]: Self::stop
pub struct Session<R: RuntimeResolver, C: CaptureSource> {
    config: Config,
    loader: AssetLoader<R>,
    uploads: UploadHandle,
    capture: C,
    lifecycle: Lifecycle,
    scheduler: Option<FrameScheduler<C::Stream>>,
}

impl<R: RuntimeResolver, C: CaptureSource> Session<R, C> {
    pub fn new(config: Config, resolver: R, capture: C) -> Self {
        let (loader, uploads) = AssetLoader::new(resolver, config.model_timeout);
        Self {
            config,
            loader,
            uploads,
            capture,
            lifecycle: Lifecycle::new(),
            scheduler: None,
        }
    }

    /// Returns a receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.lifecycle.subscribe()
    }

    pub fn status(&self) -> Status {
        self.lifecycle.status()
    }

    /// Returns a handle for submitting a model file once the manual upload is offered.
    pub fn upload_handle(&self) -> UploadHandle {
        self.uploads.clone()
    }

    /// Loads everything and starts calling `on_signal` once per processed frame.
    ///
    /// Returns once the session is `ready`. If loading or camera acquisition fails, the session
    /// moves to the terminal `error` state and the error is returned. Starting a session that is
    /// not `idle` returns [`Error::Lifecycle`] and leaves it untouched.
    pub async fn start(
        &mut self,
        on_signal: impl FnMut(GestureSignal) + Send + 'static,
    ) -> Result<(), Error> {
        self.lifecycle.advance(LoadState::Initializing)?;

        match self.run(on_signal).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("{e}");
                if let Err(invalid) = self.lifecycle.fail(e.to_string()) {
                    log::debug!("{invalid}");
                }
                Err(e)
            }
        }
    }

    async fn run(
        &mut self,
        on_signal: impl FnMut(GestureSignal) + Send + 'static,
    ) -> Result<(), Error> {
        let engine = self
            .loader
            .load(
                &self.lifecycle,
                &self.config.runtime,
                &self.config.model,
                self.config.delegate,
            )
            .await?;

        self.lifecycle.advance(LoadState::RequestingCamera)?;
        let stream = self.capture.acquire(&self.config.capture).await?;

        self.lifecycle.advance(LoadState::Ready)?;
        let lifecycle = self.lifecycle.clone();
        self.scheduler = Some(FrameScheduler::start(
            engine,
            stream,
            GestureClassifier::new(self.config.classifier),
            self.config.refresh_interval(),
            on_signal,
            move |e| {
                if let Err(invalid) = lifecycle.fail(e.to_string()) {
                    log::debug!("{invalid}");
                }
            },
        ));
        Ok(())
    }

    /// Whether frames are being processed.
    ///
    /// Turns `false` once the session is stopped or the camera fails while streaming. A camera
    /// failure also moves the session to the terminal `error` state.
    pub fn is_running(&self) -> bool {
        self.scheduler.as_ref().map_or(false, |s| s.is_running())
    }

    /// Stops the frame loop and releases the camera.
    ///
    /// Does nothing if the session never started streaming or was already stopped.
    pub async fn stop(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop().await;
            log::info!("session stopped");
        }
    }
}
