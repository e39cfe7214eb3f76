use std::{env, path::PathBuf};

use anyhow::Context;
use handsignal::{
    config::Config, lifecycle::Status, loader::UploadHandle, nn::tract::TractResolver,
    session::Session, video::webcam::WebcamSource,
};
use tokio::sync::watch;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    handsignal::init_logger!();

    let config = Config::from_env()?;
    let manual_model = env::var_os("HANDSIGNAL_MANUAL_MODEL").map(PathBuf::from);

    let mut session = Session::new(
        config.clone(),
        TractResolver::new(config.presence_threshold),
        WebcamSource,
    );
    tokio::spawn(watch_status(
        session.subscribe(),
        session.upload_handle(),
        manual_model,
    ));

    session
        .start(|signal| log::info!("{signal:?}"))
        .await
        .context("failed to start hand tracking")?;

    let mut status = session.subscribe();
    let failed = async move { status.wait_for(|s| s.state.is_terminal()).await.is_ok() };
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        true = failed => log::error!("hand tracking stopped"),
    }
    session.stop().await;
    Ok(())
}

/// Logs status changes and submits the manual model file once it is asked for.
async fn watch_status(
    mut status: watch::Receiver<Status>,
    uploads: UploadHandle,
    mut manual_model: Option<PathBuf>,
) {
    loop {
        let current = status.borrow_and_update().clone();
        match &current.message {
            Some(message) => log::info!("status: {} ({message})", current.state),
            None => log::info!("status: {}", current.state),
        }

        if current.manual_upload_offered {
            match manual_model.take() {
                Some(path) => match tokio::fs::read(&path).await {
                    Ok(data) => {
                        log::info!("submitting {}", path.display());
                        if uploads.submit(data).is_err() {
                            log::debug!("model is already loaded");
                        }
                    }
                    Err(e) => log::error!("failed to read {}: {e}", path.display()),
                },
                None if current.state.is_blocking() => {
                    log::warn!("set HANDSIGNAL_MANUAL_MODEL to a local model file to continue");
                }
                None => {}
            }
        }

        if status.changed().await.is_err() {
            return;
        }
    }
}
