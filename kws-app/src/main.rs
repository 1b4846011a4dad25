//! Keyword-spotting host entry point.
//!
//! Opens the default (or configured) microphone, runs the recognizer and
//! prints detections whose score clears `detectionThreshold`. Runs until
//! Ctrl-C.
//!
//! ```text
//! kws [--settings <path>] [--stub]
//! ```

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use kws_core::{inference::Model, CpalMicrophone, MelSpectrumTransform, Recognizer, StubModel};
use settings::{default_settings_path, load_settings, AppSettings};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct CliArgs {
    settings_path: Option<PathBuf>,
    force_stub: bool,
}

impl CliArgs {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--settings" => {
                    let path = args.next().context("--settings needs a path")?;
                    parsed.settings_path = Some(PathBuf::from(path));
                }
                "--stub" => parsed.force_stub = true,
                other => bail!("unknown argument: {other}"),
            }
        }
        Ok(parsed)
    }
}

#[cfg_attr(not(feature = "onnx"), allow(unused_variables))]
fn build_model(settings: &AppSettings, force_stub: bool) -> anyhow::Result<Box<dyn Model>> {
    #[cfg(feature = "onnx")]
    {
        if !force_stub {
            if let Some(config) = settings.onnx_model_config() {
                let model =
                    kws_core::OnnxModel::load(config).context("failed to load keyword model")?;
                return Ok(Box::new(model));
            }
        }
    }

    if !force_stub {
        warn!("no keyword model configured, using the stub model");
    }
    Ok(Box::new(StubModel::default()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kws_app=info,kws_core=info")),
        )
        .init();

    let args = CliArgs::parse(std::env::args().skip(1))?;
    let settings_path = args.settings_path.unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);
    info!(path = %settings_path.display(), "settings loaded");

    let model = build_model(&settings, args.force_stub)?;
    let device = settings.preferred_input_device.clone();
    let recognizer = Arc::new(Recognizer::new(
        settings.recognizer_config(),
        move || Ok(CpalMicrophone::new(device.clone())),
        Box::new(MelSpectrumTransform::new()),
        model,
    )?);

    let mut detections = recognizer.subscribe_detections();
    let threshold = settings.detection_threshold;
    let printer = tokio::spawn(async move {
        loop {
            match detections.recv().await {
                Ok(event) if event.score >= threshold => {
                    println!(
                        "{:>8} ms  {:<8} {:.3}",
                        event.audio_time_ms, event.label, event.score
                    );
                }
                Ok(event) => {
                    debug!(label = event.label.as_str(), score = event.score, "below threshold");
                }
                Err(RecvError::Lagged(n)) => warn!(missed = n, "detection printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // start() blocks until the device is open.
    let starter = Arc::clone(&recognizer);
    tokio::task::spawn_blocking(move || starter.start())
        .await
        .context("start task panicked")?
        .context("failed to start recognizer")?;
    info!("listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    info!("shutting down");

    let stopper = Arc::clone(&recognizer);
    tokio::task::spawn_blocking(move || stopper.shutdown())
        .await
        .context("shutdown task panicked")?;
    printer.abort();

    let snap = recognizer.pipeline_diagnostics_snapshot();
    info!(
        iterations = snap.iterations,
        inferences = snap.inferences,
        feature_errors = snap.feature_errors,
        resyncs = snap.resyncs,
        "recognizer stopped"
    );
    Ok(())
}
