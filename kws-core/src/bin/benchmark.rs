//! Latency benchmark for the feature and inference path.
//!
//! Feeds a synthetic tone through `FeatureProvider` + `MelSpectrumTransform`
//! and the selected model, timing a full resync (every slice), a steady-state
//! update (one slice) and one inference.

use std::path::PathBuf;
use std::time::Instant;

use kws_core::features::{AudioSource, FeatureProvider, MelSpectrumTransform};
use kws_core::inference::{InferenceDriver, Model};
use kws_core::settings::{CATEGORY_LABELS, SAMPLE_RATE, STRIDE_MS};
use kws_core::StubModel;
use serde::Serialize;

#[derive(Debug)]
struct Args {
    iterations: usize,
    output: Option<PathBuf>,
    #[cfg_attr(not(feature = "onnx"), allow(dead_code))]
    model: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
struct StageSummary {
    stage: String,
    runs: usize,
    p50_us: f64,
    p95_us: f64,
    avg_us: f64,
    max_us: f64,
}

#[derive(Debug, Clone, Serialize)]
struct Summary {
    iterations: usize,
    model: String,
    stages: Vec<StageSummary>,
}

/// 440 Hz plus a slow sweep, generated on demand.
struct SyntheticSource {
    n: u64,
}

impl AudioSource for SyntheticSource {
    fn pull(&mut self, _slice_start_ms: u64, out: &mut [i16]) -> usize {
        use std::f32::consts::PI;
        for s in out.iter_mut() {
            let t = self.n as f32 / SAMPLE_RATE as f32;
            let sweep = 300.0 + 50.0 * (t * 0.5).sin();
            let v = 0.3 * (2.0 * PI * 440.0 * t).sin() + 0.1 * (2.0 * PI * sweep * t).sin();
            *s = (v * i16::MAX as f32) as i16;
            self.n += 1;
        }
        out.len()
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut iterations: usize = 200;
    let mut output: Option<PathBuf> = None;
    let mut model: Option<PathBuf> = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--iterations" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --iterations".into());
                };
                iterations = v
                    .parse::<usize>()
                    .map_err(|_| "invalid value for --iterations".to_string())?
                    .clamp(1, 100_000);
            }
            "--output" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --output".into());
                };
                output = Some(PathBuf::from(v));
            }
            "--model" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --model".into());
                };
                model = Some(PathBuf::from(v));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p kws-core --release --bin benchmark -- \\
  [--iterations <n>] [--output <file.json>] [--model <file.onnx>]"
                );
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    Ok(Args {
        iterations,
        output,
        model,
    })
}

fn load_model(args: &Args) -> Result<(Box<dyn Model>, String), String> {
    #[cfg(feature = "onnx")]
    if let Some(path) = args.model.as_ref() {
        let config = kws_core::OnnxModelConfig {
            model_path: path.clone(),
            ..kws_core::OnnxModelConfig::default()
        };
        let model = kws_core::OnnxModel::load(config).map_err(|e| e.to_string())?;
        return Ok((Box::new(model), path.display().to_string()));
    }
    #[cfg(not(feature = "onnx"))]
    if args.model.is_some() {
        return Err("--model requires the 'onnx' feature".into());
    }
    Ok((Box::new(StubModel::default()), "stub".into()))
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn summarize(stage: &str, samples: &[f64]) -> StageSummary {
    let avg_us = if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    };
    StageSummary {
        stage: stage.into(),
        runs: samples.len(),
        p50_us: percentile(samples, 0.50),
        p95_us: percentile(samples, 0.95),
        avg_us,
        max_us: samples.iter().copied().fold(0.0, f64::max),
    }
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let (model, model_name) = load_model(&args)?;
    let mut driver =
        InferenceDriver::new(model, &CATEGORY_LABELS[..]).map_err(|e| e.to_string())?;
    let mut provider = FeatureProvider::new(Box::new(MelSpectrumTransform::new()));
    let mut source = SyntheticSource { n: 0 };

    let stride = STRIDE_MS as u64;
    let mut now_ms = 0u64;
    let mut full = Vec::with_capacity(args.iterations);
    let mut single = Vec::with_capacity(args.iterations);
    let mut infer = Vec::with_capacity(args.iterations);

    for _ in 0..args.iterations {
        provider.request_resync();
        let t0 = Instant::now();
        provider
            .populate(&mut source, now_ms, now_ms)
            .map_err(|e| e.to_string())?;
        full.push(t0.elapsed().as_secs_f64() * 1e6);

        let t0 = Instant::now();
        provider
            .populate(&mut source, now_ms, now_ms + stride)
            .map_err(|e| e.to_string())?;
        single.push(t0.elapsed().as_secs_f64() * 1e6);
        now_ms += stride;

        let t0 = Instant::now();
        driver.run(provider.state()).map_err(|e| e.to_string())?;
        infer.push(t0.elapsed().as_secs_f64() * 1e6);
    }

    let summary = Summary {
        iterations: args.iterations,
        model: model_name,
        stages: vec![
            summarize("populate_full_resync", &full),
            summarize("populate_one_slice", &single),
            summarize("inference", &infer),
        ],
    };

    for stage in &summary.stages {
        println!(
            "{:<22} p50 {:>9.1} us  p95 {:>9.1} us  avg {:>9.1} us  max {:>9.1} us",
            stage.stage, stage.p50_us, stage.p95_us, stage.avg_us, stage.max_us
        );
    }

    if let Some(path) = args.output.as_ref() {
        let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
        std::fs::write(path, json).map_err(|e| e.to_string())?;
        println!("summary written to {}", path.display());
    }
    Ok(())
}
