use gans_rs::config::Overrides;
use gans_rs::dataset::{BatchSource, TensorSource};
use gans_rs::model::{Batch, Conditioning};
use gans_rs::{Hyperparams, JobSpec, Paths, Registry, Session, TrainOptions, Trainer};
use proptest::prelude::*;
use tch::{Device, Kind, Tensor};

fn small(model: &str, overrides: Overrides) -> (Session, Hyperparams) {
    let base = Overrides {
        z_dim: overrides.z_dim.or(Some(8)),
        base_filters: overrides.base_filters.or(Some(2)),
        batch_size: overrides.batch_size.or(Some(4)),
        seed: overrides.seed.or(Some(7)),
        ..overrides
    };
    let job = JobSpec { model_name: model.to_string(), epochs: 1, mnist_type: "digits".to_string(), overrides: base };
    let entry = *Registry::builtin().get(model).unwrap();
    let params = entry.hyperparams(&job).unwrap();
    (entry.instantiate(&params, Device::Cpu).unwrap(), params)
}

fn zeros_batch(conditioning: Conditioning) -> Batch {
    let images = Tensor::zeros([4, 1, 28, 28], (Kind::Float, Device::Cpu));
    let labels = Tensor::zeros([4], (Kind::Int64, Device::Cpu));
    Batch::prepare(&images, &labels, None, conditioning).unwrap()
}

fn snapshot(vs: &tch::nn::VarStore) -> Vec<Tensor> {
    vs.trainable_variables().iter().map(|t| t.copy()).collect()
}

fn unchanged(before: &[Tensor], vs: &tch::nn::VarStore) -> bool {
    let after = vs.trainable_variables();
    before.len() == after.len() && before.iter().zip(&after).all(|(a, b)| a.equal(b))
}

#[test]
fn one_step_on_a_zero_batch_gives_finite_losses() {
    let (mut session, _) = small("dcgan", Overrides::default());
    let report = session.step(&zeros_batch(Conditioning::None)).unwrap();
    assert_eq!(report.step, 0);
    assert!(report.discriminator_loss.is_finite());
    assert!(report.generator_loss.unwrap().is_finite());
    assert_eq!(session.steps(), 1);
}

#[test]
fn each_update_touches_only_its_own_network() {
    let (mut session, _) = small("dcgan", Overrides::default());
    let batch = zeros_batch(Conditioning::None);

    let discriminator = snapshot(session.discriminator_vs());
    let generator = snapshot(session.generator_vs());
    session.generator_step(&batch).unwrap();
    assert!(unchanged(&discriminator, session.discriminator_vs()));
    assert!(!unchanged(&generator, session.generator_vs()));

    let generator = snapshot(session.generator_vs());
    session.discriminator_step(&batch).unwrap();
    assert!(unchanged(&generator, session.generator_vs()));
    assert!(!unchanged(&discriminator, session.discriminator_vs()));
}

#[test]
fn critic_weights_are_clipped_after_each_update() {
    let (mut session, _) = small("wgan", Overrides::default());
    session.discriminator_step(&zeros_batch(Conditioning::None)).unwrap();
    for var in session.discriminator_vs().trainable_variables() {
        assert!(var.abs().max().double_value(&[]) <= 0.01 + 1e-7);
    }
}

#[test]
fn critic_ratio_sets_the_generator_schedule() {
    let (mut session, params) = small("wgan", Overrides::default());
    assert_eq!(params.train_ratio, 5);
    let batch = zeros_batch(Conditioning::None);
    let mut generator_steps = 0;
    for _ in 0..20 {
        if session.step(&batch).unwrap().generator_loss.is_some() {
            generator_steps += 1;
        }
    }
    assert_eq!(generator_steps, 4);
    assert_eq!(session.generator_updates(), 4);
    assert_eq!(session.discriminator_updates(), 20);
}

#[test]
fn conditional_model_trains_on_labels() {
    let (mut session, _) = small("cdcgan", Overrides::default());
    let conditioning = session.networks().conditioning();
    assert_eq!(conditioning, Conditioning::Labels { classes: 10 });
    let report = session.step(&zeros_batch(conditioning)).unwrap();
    assert!(report.discriminator_loss.is_finite());
}

#[test]
fn vanilla_gan_steps_on_probabilities() {
    let (mut session, _) = small("gan", Overrides::default());
    let report = session.step(&zeros_batch(Conditioning::None)).unwrap();
    assert!(report.discriminator_loss.is_finite());
    assert!(report.generator_loss.unwrap().is_finite());
}

#[test]
fn pix2pix_step_includes_the_reconstruction_term() {
    let (mut session, params) = small("pix2pix", Overrides { base_filters: Some(1), batch_size: Some(2), ..Default::default() });
    assert_eq!(params.l1_weight, 100.0);
    let images = Tensor::rand([2, 3, 512, 512], (Kind::Float, Device::Cpu));
    let sources = Tensor::rand([2, 3, 512, 512], (Kind::Float, Device::Cpu));
    let labels = Tensor::zeros([2], (Kind::Int64, Device::Cpu));
    let batch = Batch::prepare(&images, &labels, Some(&sources), Conditioning::Paired).unwrap();

    let report = session.step(&batch).unwrap();
    assert!(report.discriminator_loss.is_finite());
    // Mean |G(x) - y| of two unrelated images is far from zero, scaled by 100.
    assert!(report.generator_loss.unwrap() > 1.0);
}

#[test]
fn trainer_writes_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths {
        data_dir: dir.path().join("data"),
        assets_dir: dir.path().join("assets"),
        checkpoint_dir: dir.path().join("checkpoints"),
    };
    let overrides = Overrides {
        print_every: Some(1),
        checkpoint_every: Some(1),
        grid_size: Some(2),
        animate: Some(true),
        ..Default::default()
    };
    let (mut session, params) = small("cdcgan", overrides.clone());
    let job = JobSpec { model_name: "cdcgan".to_string(), epochs: 2, mnist_type: "synthetic".to_string(), overrides };

    let images = Tensor::rand([8, 1, 28, 28], (Kind::Float, Device::Cpu));
    let labels = Tensor::arange(8, (Kind::Int64, Device::Cpu)).remainder(10);
    let mut source = TensorSource::new(images, labels).unwrap();
    assert_eq!(source.num_examples(), 8);

    let mut trainer = Trainer::new(TrainOptions::new(&job, params, &paths));
    let summary = trainer.run(&mut session, &mut source).unwrap();
    assert_eq!(summary.steps, 4);
    assert_eq!(summary.discriminator_updates, 4);
    assert_eq!(trainer.history().samples().len(), 4);
    assert_eq!(summary.checkpoint.as_deref(), Some(paths.checkpoints("cdcgan").join("epoch-0002").as_path()));

    let assets = paths.assets("cdcgan");
    for name in [
        "synthetic-val-e001.png",
        "synthetic-val-e002.png",
        "synthetic-losses.png",
        "synthetic-losses.csv",
        "synthetic-by-epochs.gif",
    ] {
        assert!(assets.join(name).is_file(), "missing {name}");
    }
    assert!(paths.checkpoints("cdcgan").join("epoch-0001").join("meta.json").is_file());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn generator_output_stays_in_tanh_range(seed in 0i64..10_000, batch in 1i64..5) {
        let (session, _) = small("dcgan", Overrides { seed: Some(seed), ..Default::default() });
        let latent = session.sample_latent(batch).unwrap() * 3.0;
        let samples = session.sample(Some(&latent), None).unwrap();
        prop_assert_eq!(samples.size(), vec![batch, 1, 28, 28]);
        prop_assert!(samples.max().double_value(&[]) <= 1.0);
        prop_assert!(samples.min().double_value(&[]) >= -1.0);
    }
}
