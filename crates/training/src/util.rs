use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use inference::{save_inference_samples, SampleWriter};
use models::{load_vgg, DecoderConfig, Fcn8, Vgg16Config};
use road_dataset::{verify_layout, DataLayout, DatasetConfig, RoadDataset};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Hyperparameters;
use crate::loss::build_optimizer;
use crate::trainer::{train, DatasetSource};
use crate::TrainBackend;

pub const CHECKPOINT_FILE: &str = "model.bin";
pub const RUN_CONFIG_FILE: &str = "run_config.json";

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    #[value(name = "ndarray")]
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train an FCN-8 road segmenter on KITTI road")]
pub struct TrainArgs {
    /// Data root holding `vgg/` and `data_road/`.
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,
    /// Where timestamped run directories are created.
    #[arg(long, default_value = "./runs")]
    pub runs_dir: PathBuf,
    /// Number of epochs.
    #[arg(long, default_value_t = 21)]
    pub epochs: usize,
    /// Batch size.
    #[arg(long, default_value_t = 40)]
    pub batch_size: usize,
    /// Seed for shuffling (random when omitted).
    #[arg(long)]
    pub seed: Option<u64>,
    /// Train only the decoder.
    #[arg(long, default_value_t = false)]
    pub freeze_backbone: bool,
    /// Start from an untrained VGG16 instead of `<data_dir>/vgg`.
    #[arg(long, default_value_t = false)]
    pub random_backbone: bool,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Checkpoint output path (defaults to `<run_dir>/model.bin`).
    #[arg(long)]
    pub checkpoint_out: Option<PathBuf>,
    /// Skip writing inference overlays after training.
    #[arg(long, default_value_t = false)]
    pub skip_samples: bool,
}

impl TrainArgs {
    pub fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters {
            epochs: self.epochs,
            batch_size: self.batch_size,
            freeze_backbone: self.freeze_backbone,
            seed: self.seed,
            ..Default::default()
        }
    }
}

type ADBackend = Autodiff<TrainBackend>;

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let hyper = args.hyperparameters();
    hyper
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid hyperparameters: {e}"))?;

    verify_layout(&args.data_dir).map_err(|e| {
        anyhow::anyhow!(
            "dataset check failed under {}: {e}",
            args.data_dir.display()
        )
    })?;
    let layout = DataLayout::new(&args.data_dir);

    let device = default_device();
    let (vgg, vgg_cfg) = if args.random_backbone {
        tracing::warn!("using an untrained backbone");
        let cfg = Vgg16Config::default();
        (cfg.init::<ADBackend>(&device), cfg)
    } else {
        let vgg_dir = args.data_dir.join("vgg");
        load_vgg::<ADBackend>(&vgg_dir, &device)
            .map_err(|e| anyhow::anyhow!("failed to load backbone from {}: {e}", vgg_dir.display()))?
    };

    let decoder_cfg = DecoderConfig {
        num_classes: hyper.num_classes,
        ..Default::default()
    };
    let model = Fcn8::new(vgg, &vgg_cfg, hyper.image_shape, &decoder_cfg, &device)
        .map_err(|e| anyhow::anyhow!("failed to build decoder: {e}"))?;
    tracing::info!(
        params = model.num_params(),
        layers = model.decoder().plan().layers().len(),
        "model ready"
    );

    let dataset = RoadDataset::open(&args.data_dir, dataset_config(&hyper))?;
    let mut source = DatasetSource::new(&dataset);
    let mut optim = build_optimizer::<ADBackend>();
    let (model, report) = train(model, &mut optim, &mut source, &hyper, &device)?;
    if !report.all_finite() {
        tracing::warn!("non-finite loss observed during training");
    }

    let writer = SampleWriter::new(&args.runs_dir)?;
    hyper
        .save(&writer.run_dir().join(RUN_CONFIG_FILE))
        .map_err(|e| anyhow::anyhow!("failed to save run config: {e}"))?;

    let ckpt_path = args
        .checkpoint_out
        .clone()
        .unwrap_or_else(|| writer.run_dir().join(CHECKPOINT_FILE));
    if let Some(parent) = ckpt_path.parent() {
        fs::create_dir_all(parent)?;
    }
    save_checkpoint(&model, &ckpt_path)?;
    tracing::info!(path = %ckpt_path.display(), "saved checkpoint");

    if args.skip_samples {
        return Ok(());
    }
    let written = save_inference_samples(
        &model.valid(),
        &writer,
        &layout.testing_images,
        hyper.image_shape,
        &device,
    )?;
    tracing::info!(
        count = written.len(),
        run_dir = %writer.run_dir().display(),
        "saved inference samples"
    );
    Ok(())
}

pub fn dataset_config(hyper: &Hyperparameters) -> DatasetConfig {
    let (height, width) = hyper.image_shape;
    DatasetConfig {
        image_shape: (height as u32, width as u32),
        seed: hyper.seed,
        ..Default::default()
    }
}

pub fn save_checkpoint<B: Backend>(model: &Fcn8<B>, path: &Path) -> anyhow::Result<()> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path, &recorder)
        .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))
}

/// Rebuild the architecture described by `vgg_cfg`/`hyper` and load weights from `path`.
pub fn load_fcn8_from_checkpoint<B: Backend>(
    path: &Path,
    vgg_cfg: &Vgg16Config,
    hyper: &Hyperparameters,
    device: &B::Device,
) -> anyhow::Result<Fcn8<B>> {
    let decoder_cfg = DecoderConfig {
        num_classes: hyper.num_classes,
        ..Default::default()
    };
    let model = Fcn8::new(
        vgg_cfg.init::<B>(device),
        vgg_cfg,
        hyper.image_shape,
        &decoder_cfg,
        device,
    )
    .map_err(|e| anyhow::anyhow!("failed to build decoder: {e}"))?;
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path, &recorder, device)
        .map_err(|e: RecorderError| anyhow::anyhow!("failed to load checkpoint {}: {e}", path.display()))
}

/// Device for the compiled backend, logged once.
pub fn default_device() -> <ADBackend as Backend>::Device {
    #[cfg(feature = "backend-wgpu")]
    tracing::info!("Using WGPU backend");
    #[cfg(not(feature = "backend-wgpu"))]
    tracing::info!("Using NdArray (CPU) backend");

    let device = <ADBackend as Backend>::Device::default();
    tracing::info!("Device initialized: {:?}", device);
    device
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}
