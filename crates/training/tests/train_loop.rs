use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, ModuleVisitor, ParamId};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor, TensorData};
use image::{Rgb, RgbImage};
use models::{DecoderConfig, Fcn8, Vgg16Config};
use road_dataset::{DataLayout, RoadBatch, RoadDataset, BACKGROUND_COLOR};
use training::util::{dataset_config, load_fcn8_from_checkpoint, save_checkpoint};
use training::{build_optimizer, train, BatchSource, DatasetSource, Hyperparameters};

type B = NdArray<f32>;
type AD = Autodiff<B>;

const SHAPE: (usize, usize) = (32, 64);

fn tiny_vgg() -> Vgg16Config {
    Vgg16Config {
        block_channels: [4, 4, 8, 8, 8],
        fc_channels: 8,
        fc6_kernel: 3,
        in_channels: 3,
    }
}

fn tiny_model<Bk: Backend>(device: &Bk::Device) -> Fcn8<Bk> {
    let cfg = tiny_vgg();
    Fcn8::new(cfg.init::<Bk>(device), &cfg, SHAPE, &DecoderConfig::default(), device)
        .expect("model")
}

fn tiny_hyper(epochs: usize, batch_size: usize) -> Hyperparameters {
    Hyperparameters {
        image_shape: SHAPE,
        epochs,
        batch_size,
        seed: Some(11),
        ..Default::default()
    }
}

/// Replays the same fixed batches every epoch.
struct InMemorySource {
    batches: Vec<RoadBatch<AD>>,
    cursor: usize,
    epochs_started: usize,
}

impl InMemorySource {
    fn new(num_batches: usize, batch_size: usize) -> Self {
        let device = Default::default();
        let (h, w) = SHAPE;
        let batches = (0..num_batches)
            .map(|_| {
                let images = Tensor::<AD, 4>::random(
                    [batch_size, 3, h, w],
                    Distribution::Uniform(0.0, 1.0),
                    &device,
                );
                // Top half background, bottom half road.
                let plane = h * w;
                let mut labels = vec![0.0f32; batch_size * 2 * plane];
                for b in 0..batch_size {
                    for i in 0..plane {
                        let road = i >= plane / 2;
                        labels[b * 2 * plane + i] = if road { 0.0 } else { 1.0 };
                        labels[b * 2 * plane + plane + i] = if road { 1.0 } else { 0.0 };
                    }
                }
                let labels = Tensor::<AD, 4>::from_data(
                    TensorData::new(labels, [batch_size, 2, h, w]),
                    &device,
                );
                RoadBatch { images, labels }
            })
            .collect();
        Self {
            batches,
            cursor: 0,
            epochs_started: 0,
        }
    }
}

impl BatchSource<AD> for InMemorySource {
    fn start_epoch(&mut self, _epoch: usize) {
        self.cursor = 0;
        self.epochs_started += 1;
    }

    fn next_batch(
        &mut self,
        _batch_size: usize,
        _device: &<AD as Backend>::Device,
    ) -> anyhow::Result<Option<RoadBatch<AD>>> {
        let batch = self.batches.get(self.cursor).cloned();
        self.cursor += 1;
        Ok(batch)
    }
}

#[test]
fn one_step_per_batch_per_epoch() -> anyhow::Result<()> {
    let device = Default::default();
    let mut source = InMemorySource::new(3, 2);
    let mut optim = build_optimizer::<AD>();
    let hyper = tiny_hyper(2, 2);

    let (_model, report) = train(
        tiny_model::<AD>(&device),
        &mut optim,
        &mut source,
        &hyper,
        &device,
    )?;

    assert_eq!(source.epochs_started, 2);
    assert_eq!(report.steps, 6);
    assert_eq!(report.records.len(), 6);
    assert!(report.all_finite());
    let order: Vec<(usize, usize)> = report.records.iter().map(|r| (r.epoch, r.batch)).collect();
    assert_eq!(order, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    assert!(report
        .records
        .windows(2)
        .all(|w| w[0].elapsed <= w[1].elapsed));
    Ok(())
}

#[test]
fn zero_epochs_takes_no_steps() -> anyhow::Result<()> {
    let device = Default::default();
    let mut source = InMemorySource::new(1, 1);
    let mut optim = build_optimizer::<AD>();
    let (_model, report) = train(
        tiny_model::<AD>(&device),
        &mut optim,
        &mut source,
        &tiny_hyper(0, 1),
        &device,
    )?;
    assert_eq!(report.steps, 0);
    assert_eq!(source.epochs_started, 0);
    Ok(())
}

/// Every float parameter of a module, flattened, in visit order.
#[derive(Default)]
struct ParamSnapshot(Vec<Vec<f32>>);

impl<Bk: Backend> ModuleVisitor<Bk> for ParamSnapshot {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<Bk, D>) {
        self.0.push(tensor.to_data().to_vec::<f32>().unwrap());
    }
}

fn snapshot<Bk: Backend, M: Module<Bk>>(module: &M) -> ParamSnapshot {
    let mut snap = ParamSnapshot::default();
    module.visit(&mut snap);
    snap
}

fn changed(before: &ParamSnapshot, after: &ParamSnapshot) -> usize {
    assert_eq!(before.0.len(), after.0.len());
    before.0.iter().zip(&after.0).filter(|(a, b)| a != b).count()
}

fn train_two_steps(freeze_backbone: bool) -> anyhow::Result<(Fcn8<AD>, Fcn8<AD>)> {
    let device = Default::default();
    let mut source = InMemorySource::new(2, 1);
    let mut optim = build_optimizer::<AD>();
    let hyper = Hyperparameters {
        freeze_backbone,
        include_regularization: true,
        ..tiny_hyper(1, 1)
    };
    let initial = tiny_model::<AD>(&device);
    let (trained, report) = train(initial.clone(), &mut optim, &mut source, &hyper, &device)?;
    assert_eq!(report.steps, 2);
    assert!(report.all_finite());
    Ok((initial, trained))
}

#[test]
fn frozen_backbone_still_trains_the_decoder() -> anyhow::Result<()> {
    let (initial, trained) = train_two_steps(true)?;
    assert_eq!(
        changed(&snapshot(initial.backbone()), &snapshot(trained.backbone())),
        0
    );
    assert!(changed(&snapshot(initial.decoder()), &snapshot(trained.decoder())) > 0);
    Ok(())
}

#[test]
fn unfrozen_backbone_is_updated() -> anyhow::Result<()> {
    let (initial, trained) = train_two_steps(false)?;
    assert!(changed(&snapshot(initial.backbone()), &snapshot(trained.backbone())) > 0);
    assert!(changed(&snapshot(initial.decoder()), &snapshot(trained.decoder())) > 0);
    Ok(())
}

fn synthetic_kitti(root: &std::path::Path, n: usize) -> anyhow::Result<()> {
    let layout = DataLayout::new(root);
    for dir in [
        &layout.training_images,
        &layout.training_labels,
        &layout.testing_images,
    ] {
        std::fs::create_dir_all(dir)?;
    }
    for i in 0..n {
        let img = RgbImage::from_fn(96, 48, |x, y| Rgb([x as u8, y as u8, 128]));
        img.save(layout.training_images.join(format!("uu_{i:06}.png")))?;
        img.save(layout.testing_images.join(format!("uu_{i:06}.png")))?;
        let mask = RgbImage::from_fn(96, 48, |_, y| {
            if y > 24 {
                Rgb([255, 0, 255])
            } else {
                Rgb(BACKGROUND_COLOR)
            }
        });
        mask.save(layout.training_labels.join(format!("uu_road_{i:06}.png")))?;
    }
    Ok(())
}

#[test]
fn trains_from_a_dataset_on_disk() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    synthetic_kitti(tmp.path(), 3)?;
    let hyper = tiny_hyper(1, 2);
    let dataset = RoadDataset::open(tmp.path(), dataset_config(&hyper))?;
    let mut source = DatasetSource::new(&dataset);

    let device = Default::default();
    let mut optim = build_optimizer::<AD>();
    let (_model, report) = train(
        tiny_model::<AD>(&device),
        &mut optim,
        &mut source,
        &hyper,
        &device,
    )?;
    // 3 samples in batches of 2: one full batch and one partial.
    assert_eq!(report.steps, dataset.batches_per_epoch(2));
    assert_eq!(report.steps, 2);
    assert!(report.all_finite());
    Ok(())
}

#[test]
fn dataset_source_requires_an_epoch() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_kitti(tmp.path(), 1).unwrap();
    let dataset = RoadDataset::open(tmp.path(), dataset_config(&tiny_hyper(1, 1))).unwrap();
    let mut source = DatasetSource::new(&dataset);
    let res = BatchSource::<B>::next_batch(&mut source, 1, &Default::default());
    assert!(res.is_err());
}

#[test]
fn checkpoint_round_trip() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("model.bin");
    let device = Default::default();
    let model = tiny_model::<B>(&device);
    save_checkpoint(&model, &path)?;

    let hyper = tiny_hyper(1, 1);
    let restored = load_fcn8_from_checkpoint::<B>(&path, &tiny_vgg(), &hyper, &device)?;

    let images = Tensor::<B, 4>::random([1, 3, SHAPE.0, SHAPE.1], Distribution::Default, &device);
    let a = model.forward(images.clone(), 1.0)?.into_data().to_vec::<f32>().unwrap();
    let b = restored.forward(images, 1.0)?.into_data().to_vec::<f32>().unwrap();
    assert_eq!(a.len(), b.len());
    assert!(a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1e-5));
    Ok(())
}
