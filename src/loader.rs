//! Runtime and model loading with a manual-upload fallback.
//!
//! The automatic model load races against an advisory timeout. When the timeout fires first the
//! manual upload is offered, but the automatic attempt keeps running: whichever attempt succeeds
//! first provides the engine. A failed automatic attempt is recoverable by uploading a model file;
//! a failed manual attempt is not.

use std::{fmt, sync::Arc, time::Duration};

use tokio::{sync::mpsc, time};

use crate::{
    assets::AssetLocation,
    lifecycle::{Lifecycle, LoadState},
    nn::{Delegate, ModelSource, RuntimeLocation, RuntimeResolver, VisionRuntime},
    Error,
};

/// The engine type produced by the runtime of resolver `R`.
pub type EngineOf<R> = <<R as RuntimeResolver>::Runtime as VisionRuntime>::Engine;

/// Which path an engine creation attempt was started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Loading from the configured model location.
    Automatic,
    /// Loading from a user-supplied model file.
    Manual,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        })
    }
}

/// What to do with the outcome of an engine creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep the engine and move on to the camera.
    Commit,
    /// Drop the outcome; loading has already moved past it.
    Ignore,
    /// Expose the error and wait for a model file.
    AwaitManual,
    /// Loading failed for good.
    Fail,
}

/// Decides what an attempt's outcome means in the current lifecycle state.
///
/// The first successful attempt wins. After that, and after loading has otherwise moved on, every
/// outcome is ignored.
pub fn resolve_outcome(state: LoadState, origin: Origin, succeeded: bool) -> Action {
    use LoadState::*;

    let loading = matches!(state, LoadingModel | WaitingForFile | LoadingModelManual);
    match (state, origin, succeeded) {
        _ if !loading => Action::Ignore,
        (_, _, true) => Action::Commit,
        (LoadingModel, Origin::Automatic, false) => Action::AwaitManual,
        (_, Origin::Automatic, false) => Action::Ignore,
        (_, Origin::Manual, false) => Action::Fail,
    }
}

/// The upload channel is closed; no model file will be accepted anymore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("model uploads are no longer accepted")]
pub struct UploadClosed;

/// Hands user-supplied model files to an [`AssetLoader`].
///
/// Files submitted before the manual upload is offered, or while a manual attempt is already in
/// flight, are dropped.
#[derive(Debug, Clone)]
pub struct UploadHandle {
    sender: mpsc::UnboundedSender<Arc<[u8]>>,
}

impl UploadHandle {
    /// Submits the contents of a model file.
    pub fn submit(&self, data: impl Into<Arc<[u8]>>) -> Result<(), UploadClosed> {
        self.sender.send(data.into()).map_err(|_| UploadClosed)
    }
}

struct Outcome<E> {
    origin: Origin,
    result: anyhow::Result<E>,
}

/// Loads the inference runtime and creates a hand landmark engine.
pub struct AssetLoader<R: RuntimeResolver> {
    resolver: R,
    model_timeout: Duration,
    uploads: mpsc::UnboundedReceiver<Arc<[u8]>>,
}

impl<R: RuntimeResolver> AssetLoader<R> {
    /// Creates a loader that offers the manual upload after `model_timeout`, and the handle that
    /// feeds it model files.
    pub fn new(resolver: R, model_timeout: Duration) -> (Self, UploadHandle) {
        let (sender, uploads) = mpsc::unbounded_channel();
        let loader = Self {
            resolver,
            model_timeout,
            uploads,
        };
        (loader, UploadHandle { sender })
    }

    /// Resolves the runtime at `runtime` and creates an engine from `model`, falling back to
    /// uploaded model files.
    ///
    /// Expects `lifecycle` to be `initializing`. On success it is left in `loading_model` or
    /// `loading_model_manual`; on failure the caller is responsible for moving it to `error`.
    pub async fn load(
        &mut self,
        lifecycle: &Lifecycle,
        runtime: &RuntimeLocation,
        model: &AssetLocation,
        delegate: Delegate,
    ) -> Result<EngineOf<R>, Error> {
        lifecycle.advance(LoadState::LoadingWasm)?;
        let runtime = self
            .resolver
            .resolve(runtime)
            .await
            .map_err(Error::runtime_load)?;
        let runtime = Arc::new(runtime);

        lifecycle.advance(LoadState::LoadingModel)?;
        log::info!("loading hand landmark model from {model}");

        // Held so that `recv` never reports a closed channel.
        let (outcome_tx, mut outcomes) = mpsc::unbounded_channel();
        spawn_attempt(
            &runtime,
            Origin::Automatic,
            ModelSource::Location(model.clone()),
            delegate,
            &outcome_tx,
        );

        let timeout = time::sleep(self.model_timeout);
        tokio::pin!(timeout);
        let mut timer_armed = true;
        let mut manual_in_flight = false;
        let mut uploads_open = true;

        loop {
            tokio::select! {
                () = &mut timeout, if timer_armed => {
                    timer_armed = false;
                    log::warn!(
                        "model did not load within {:?}, offering manual upload",
                        self.model_timeout,
                    );
                    lifecycle.offer_manual_upload();
                }
                Some(outcome) = outcomes.recv() => {
                    let Outcome { origin, result } = outcome;
                    if origin == Origin::Manual {
                        manual_in_flight = false;
                    }

                    match (resolve_outcome(lifecycle.state(), origin, result.is_ok()), result) {
                        (Action::Commit, Ok(engine)) => {
                            log::info!("hand landmark engine ready ({origin} load)");
                            return Ok(engine);
                        }
                        (Action::AwaitManual, Err(e)) => {
                            timer_armed = false;
                            log::warn!("{origin} model load failed: {e:#}");
                            lifecycle.await_file(format!("{e:#}"))?;
                            if !uploads_open {
                                let e = e.context("no model file can be uploaded");
                                return Err(Error::model_load(e));
                            }
                        }
                        (Action::Fail, Err(e)) => return Err(Error::model_load(e)),
                        (_, Ok(_)) => log::debug!("dropping engine from {origin} load"),
                        (_, Err(e)) => log::debug!("ignoring {origin} load failure: {e:#}"),
                    }
                }
                upload = self.uploads.recv(), if uploads_open => {
                    let Some(data) = upload else {
                        uploads_open = false;
                        if lifecycle.state() == LoadState::WaitingForFile && !manual_in_flight {
                            return Err(Error::ModelLoad("no model file was uploaded".into()));
                        }
                        continue;
                    };

                    if !lifecycle.manual_upload_offered() || manual_in_flight {
                        log::warn!("model upload not expected right now, ignoring it");
                        continue;
                    }

                    log::info!("loading uploaded model file ({} bytes)", data.len());
                    lifecycle.advance(LoadState::LoadingModelManual)?;
                    timer_armed = false;
                    manual_in_flight = true;
                    spawn_attempt(
                        &runtime,
                        Origin::Manual,
                        ModelSource::Buffer(data),
                        delegate,
                        &outcome_tx,
                    );
                }
            }
        }
    }
}

fn spawn_attempt<T: VisionRuntime>(
    runtime: &Arc<T>,
    origin: Origin,
    source: ModelSource,
    delegate: Delegate,
    outcomes: &mpsc::UnboundedSender<Outcome<T::Engine>>,
) {
    let runtime = runtime.clone();
    let outcomes = outcomes.clone();
    tokio::spawn(async move {
        let result = runtime.create_engine(source, delegate).await;
        if outcomes.send(Outcome { origin, result }).is_err() {
            log::debug!("loading finished before the {origin} attempt did, dropping its result");
        }
    });
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use async_trait::async_trait;
    use tokio::time::sleep;

    use super::*;
    use crate::{hand::landmark::HandFrameResult, nn::HandLandmarker, video::Frame};
    use LoadState::*;

    #[test]
    fn first_success_wins() {
        for state in [LoadingModel, WaitingForFile, LoadingModelManual] {
            assert_eq!(resolve_outcome(state, Origin::Automatic, true), Action::Commit);
            assert_eq!(resolve_outcome(state, Origin::Manual, true), Action::Commit);
        }
        for state in [RequestingCamera, Ready, LoadState::Error] {
            for origin in [Origin::Automatic, Origin::Manual] {
                assert_eq!(resolve_outcome(state, origin, true), Action::Ignore);
                assert_eq!(resolve_outcome(state, origin, false), Action::Ignore);
            }
        }
    }

    #[test]
    fn failures() {
        assert_eq!(
            resolve_outcome(LoadingModel, Origin::Automatic, false),
            Action::AwaitManual
        );
        assert_eq!(
            resolve_outcome(LoadingModelManual, Origin::Automatic, false),
            Action::Ignore
        );
        assert_eq!(
            resolve_outcome(LoadingModelManual, Origin::Manual, false),
            Action::Fail
        );
    }

    struct Engine(Origin);

    impl HandLandmarker for Engine {
        fn detect_for_video(&mut self, _: &Frame, _: Duration) -> anyhow::Result<HandFrameResult> {
            Ok(HandFrameResult::absent())
        }
    }

    struct Runtime {
        auto_delay: Duration,
        auto_ok: bool,
    }

    #[async_trait]
    impl VisionRuntime for Runtime {
        type Engine = Engine;

        async fn create_engine(&self, model: ModelSource, _: Delegate) -> anyhow::Result<Engine> {
            match model {
                ModelSource::Location(_) => {
                    sleep(self.auto_delay).await;
                    if !self.auto_ok {
                        bail!("connection reset");
                    }
                    Ok(Engine(Origin::Automatic))
                }
                ModelSource::Buffer(data) => {
                    sleep(Duration::from_millis(100)).await;
                    if &*data == b"bad" {
                        bail!("not an ONNX model");
                    }
                    Ok(Engine(Origin::Manual))
                }
            }
        }
    }

    struct Resolver {
        auto_delay: u64,
        auto_ok: bool,
    }

    #[async_trait]
    impl RuntimeResolver for Resolver {
        type Runtime = Runtime;

        async fn resolve(&self, location: &RuntimeLocation) -> anyhow::Result<Runtime> {
            if location.as_str() != "mock" {
                bail!("no runtime at '{location}'");
            }
            Ok(Runtime {
                auto_delay: Duration::from_millis(self.auto_delay),
                auto_ok: self.auto_ok,
            })
        }
    }

    fn loader(auto_delay: u64, auto_ok: bool) -> (AssetLoader<Resolver>, UploadHandle, Lifecycle) {
        let (loader, uploads) = AssetLoader::new(
            Resolver {
                auto_delay,
                auto_ok,
            },
            Duration::from_millis(3000),
        );
        let lifecycle = Lifecycle::new();
        lifecycle.advance(Initializing).unwrap();
        (loader, uploads, lifecycle)
    }

    async fn load(
        loader: &mut AssetLoader<Resolver>,
        lifecycle: &Lifecycle,
    ) -> Result<Engine, crate::Error> {
        loader
            .load(
                lifecycle,
                &RuntimeLocation::new("mock"),
                &"model.onnx".parse().unwrap(),
                Delegate::Gpu,
            )
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn automatic_before_timeout() {
        let (mut loader, _uploads, lc) = loader(1000, true);
        let engine = load(&mut loader, &lc).await.unwrap();
        assert_eq!(engine.0, Origin::Automatic);
        assert_eq!(lc.state(), LoadingModel);
        assert!(!lc.manual_upload_offered());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_automatic_still_wins() {
        let (mut loader, _uploads, lc) = loader(4000, true);
        let engine = load(&mut loader, &lc).await.unwrap();
        assert_eq!(engine.0, Origin::Automatic);
        assert!(lc.manual_upload_offered());
    }

    #[tokio::test(start_paused = true)]
    async fn early_upload_is_ignored() {
        let (mut loader, uploads, lc) = loader(1000, true);
        uploads.submit(b"model".to_vec()).unwrap();
        let engine = load(&mut loader, &lc).await.unwrap();
        assert_eq!(engine.0, Origin::Automatic);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_wins_while_automatic_pending() {
        let (mut loader, uploads, lc) = loader(10_000, true);
        let status = lc.subscribe();
        let (engine, ()) = tokio::join!(load(&mut loader, &lc), async {
            sleep(Duration::from_millis(3500)).await;
            assert!(status.borrow().manual_upload_offered);
            assert_eq!(status.borrow().state, LoadingModel);
            uploads.submit(b"model".to_vec()).unwrap();
        });
        assert_eq!(engine.unwrap().0, Origin::Manual);
        assert_eq!(lc.state(), LoadingModelManual);
    }

    #[tokio::test(start_paused = true)]
    async fn early_automatic_failure_waits_for_file() {
        let (mut loader, uploads, lc) = loader(500, false);
        let status = lc.subscribe();
        let (engine, ()) = tokio::join!(load(&mut loader, &lc), async {
            sleep(Duration::from_millis(1000)).await;
            let current = status.borrow().clone();
            assert_eq!(current.state, WaitingForFile);
            assert!(current.manual_upload_offered);
            assert!(current.message.unwrap().contains("connection reset"));
            uploads.submit(b"model".to_vec()).unwrap();
        });
        assert_eq!(engine.unwrap().0, Origin::Manual);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_failure_is_fatal() {
        let (mut loader, uploads, lc) = loader(500, false);
        let (engine, ()) = tokio::join!(load(&mut loader, &lc), async {
            sleep(Duration::from_millis(1000)).await;
            uploads.submit(b"bad".to_vec()).unwrap();
        });
        let err = engine.err().unwrap();
        assert!(matches!(err, crate::Error::ModelLoad(_)));
        assert!(err.to_string().contains("not an ONNX model"));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_uploads_while_waiting() {
        let (mut loader, uploads, lc) = loader(500, false);
        drop(uploads);
        let err = load(&mut loader, &lc).await.err().unwrap();
        assert!(matches!(err, crate::Error::ModelLoad(_)));
        assert_eq!(lc.state(), WaitingForFile);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_failure() {
        let (mut loader, _uploads, lc) = loader(500, true);
        let err = loader
            .load(
                &lc,
                &RuntimeLocation::new("elsewhere"),
                &"model.onnx".parse().unwrap(),
                Delegate::Gpu,
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, crate::Error::RuntimeLoad(_)));
        assert_eq!(lc.state(), LoadingWasm);
    }
}
