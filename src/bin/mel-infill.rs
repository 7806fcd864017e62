//! mel-infill CLI — regenerate masked spans of a mel spectrogram.
//!
//! Reads a safetensors file holding the upstream per-frame hidden states, the
//! reference mel and the edit mask, runs the bidirectional infill decoder and
//! writes the edited mel plus per-span directional predictions.
//!
//! # Inputs
//!
//! - `context_hidden` `[B, T, H]`: already context-conditioned hidden states, or
//! - `hidden` `[B, T, H]`: raw upstream states; the visible mel is injected
//!   by the context encoder (`mel_encoder.*` weights) first
//! - `mel` `[B, T, D]`: reference mel
//! - `mask` `[T]`: non-zero = regenerate
//! - `nonpadding` `[B, T]` (optional)
//!
//! # Output
//!
//! Writes `mel`, `merged.{i}`, `forward.{i}`, `backward.{i}` to --output and
//! prints a one-line JSON summary to stdout:
//!
//! ```json
//! {"path":"/tmp/edited.safetensors","frames":412,"spans":2,"masked_frames":57,"mode":"infer","diverged":false}
//! ```

use std::collections::HashMap;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, ValueEnum};
use mel_infill::config::InfillConfig;
use mel_infill::mask::mask_from_tensor;
use mel_infill::model::context::{MaskedContextProducer, MelContextProducer};
use mel_infill::pipeline::{EditRequest, InfillPipeline, RunMode, load_weights};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Teacher-forced rollouts using the reference frames inside each span.
    Train,
    /// Free-running rollouts; the masked reference content is never read.
    Infer,
}

#[derive(Parser, Debug)]
#[command(
    name = "mel-infill",
    about = "Bidirectional masked-span mel infilling",
    long_about = "Regenerate the masked spans of a mel spectrogram from per-frame hidden states.\n\
                  Without --weights the decoder is randomly initialised (smoke testing only)."
)]
struct Args {
    /// Input safetensors file with hidden states, reference mel and mask.
    #[arg(long, short = 'i')]
    inputs: String,

    /// Output safetensors path.
    #[arg(long, short = 'o')]
    output: String,

    /// Decoder checkpoint (safetensors).
    #[arg(long, short = 'w')]
    weights: Option<String>,

    /// JSON config; unspecified fields take their defaults.
    #[arg(long, short = 'c')]
    config: Option<String>,

    /// Decoding mode.
    #[arg(long, value_enum, default_value_t = Mode::Infer)]
    mode: Mode,

    /// Teacher-forcing seed, overriding the config.
    #[arg(long, short = 's')]
    seed: Option<u64>,
}

fn required<'a>(inputs: &'a HashMap<String, Tensor>, name: &str) -> anyhow::Result<&'a Tensor> {
    inputs
        .get(name)
        .with_context(|| format!("inputs file has no `{name}` tensor"))
}

/// Checkpoint weights, or fresh random ones when no checkpoint is given.
fn decoder_vars(
    weights: Option<&str>,
    dtype: DType,
    device: &Device,
) -> mel_infill::Result<VarBuilder<'static>> {
    match weights {
        Some(path) => load_weights(path, dtype, device),
        None => {
            tracing::warn!("no --weights given, decoder is randomly initialised");
            Ok(VarBuilder::from_varmap(&VarMap::new(), dtype, device))
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => InfillConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {path}"))?,
        None => InfillConfig::default(),
    };
    if let Some(seed) = args.seed {
        cfg.seed = seed;
    }

    let device = Device::cuda_if_available(0)?;
    let dtype = DType::F32;
    tracing::info!("Using device: {:?}", device);

    let vb = decoder_vars(args.weights.as_deref(), dtype, &device)?;

    let inputs = candle_core::safetensors::load(&args.inputs, &device)
        .with_context(|| format!("failed to read inputs {}", args.inputs))?;
    let mels = required(&inputs, "mel")?.to_dtype(dtype)?;
    let mask = mask_from_tensor(required(&inputs, "mask")?)?;

    let context_hidden = match inputs.get("context_hidden") {
        Some(context) => context.to_dtype(dtype)?,
        None => {
            let hidden = required(&inputs, "hidden")?.to_dtype(dtype)?;
            let nonpadding = inputs
                .get("nonpadding")
                .map(|t| t.to_dtype(dtype))
                .transpose()?;
            let producer = MelContextProducer::new(&cfg, vb.pp("mel_encoder"))?;
            producer.produce(&hidden, &mask, &mels, nonpadding.as_ref())?
        }
    };

    let mut pipeline = InfillPipeline::new(&cfg, vb)?;
    let run_mode = match args.mode {
        Mode::Train => RunMode::Train,
        Mode::Infer => RunMode::Infer,
    };

    let edit = pipeline.run(
        &EditRequest {
            context_hidden: &context_hidden,
            mask: &mask,
            reference_mels: &mels,
        },
        run_mode,
    )?;

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    tensors.insert("mel".to_string(), edit.mel.clone());
    for (i, span) in edit.spans.iter().enumerate() {
        tensors.insert(format!("merged.{i}"), span.merged.clone());
        tensors.insert(format!("forward.{i}"), span.outputs.forward.clone());
        tensors.insert(format!("backward.{i}"), span.outputs.backward.clone());
    }

    if let Some(parent) = std::path::Path::new(&args.output).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    candle_core::safetensors::save(&tensors, &args.output)
        .with_context(|| format!("failed to write {}", args.output))?;

    let summary = serde_json::json!({
        "path": args.output,
        "frames": mask.len(),
        "spans": edit.spans.len(),
        "masked_frames": mask.iter().filter(|&&m| m).count(),
        "mode": format!("{:?}", args.mode).to_lowercase(),
        "diverged": edit.has_divergence(),
    });
    println!("{summary}");

    Ok(())
}
