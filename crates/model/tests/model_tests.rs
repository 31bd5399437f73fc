use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, SeedableRng};
use simclr_model::{classification_head, EncoderConfig, ModelConfig, Parameterized, PretrainNet};

fn build_config() -> ModelConfig {
    ModelConfig {
        encoder: EncoderConfig {
            in_channels: 10,
            stem_channels: 4,
            stage_channels: vec![4, 8],
        },
        fc_hid_dim: 6,
        fc_out_dim: 3,
    }
}

#[test]
fn forward_pair_produces_embeddings() -> Result<()> {
    let device = Device::Cpu;
    let net = PretrainNet::new(&build_config(), &mut StdRng::seed_from_u64(0), &device)?;
    let x_i = Tensor::randn(0f32, 1.0, (2, 10, 16, 16), &device)?;
    let x_j = Tensor::randn(0f32, 1.0, (2, 10, 16, 16), &device)?;

    let (z_i, z_j) = net.forward_pair(&x_i, &x_j)?;

    assert_eq!(z_i.dims(), &[2, 3]);
    assert_eq!(z_j.dims(), &[2, 3]);
    assert_eq!(z_i.dtype(), DType::F32);
    Ok(())
}

#[test]
fn forward_pair_matches_separate_passes() -> Result<()> {
    let device = Device::Cpu;
    let net = PretrainNet::new(&build_config(), &mut StdRng::seed_from_u64(3), &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 10, 8, 8), &device)?;

    let (z_i, z_j) = net.forward_pair(&x, &x)?;
    let diff = (z_i - z_j)?.abs()?.max_all()?.to_scalar::<f32>()?;

    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn into_classifier_drops_projection_head() -> Result<()> {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(1);
    let net = PretrainNet::new(&build_config(), &mut rng, &device)?;
    let encoder_tensors = net.encoder().parameters().len();
    assert!(net
        .named_parameters()
        .iter()
        .any(|(name, _)| name.starts_with("projection.")));

    let head = classification_head(net.encoder().output_dim(), 5, &mut rng, &device)?;
    let classifier = net.into_classifier(head)?;
    let names: Vec<String> = classifier
        .named_parameters()
        .into_iter()
        .map(|(name, _)| name)
        .collect();

    assert_eq!(names.len(), encoder_tensors + 2);
    assert!(names.iter().all(|name| !name.starts_with("projection.")));
    assert!(names.contains(&"head.weight".to_string()));

    let logits = classifier.forward(&Tensor::zeros((3, 10, 16, 16), DType::F32, &device)?)?;
    assert_eq!(logits.dims(), &[3, 5]);
    Ok(())
}

#[test]
fn freezing_encoder_leaves_only_head_trainable() -> Result<()> {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(2);
    let net = PretrainNet::new(&build_config(), &mut rng, &device)?;
    let head = classification_head(net.encoder().output_dim(), 4, &mut rng, &device)?;
    let mut classifier = net.into_classifier(head)?;

    classifier.encoder_mut().set_trainable(false);
    assert_eq!(classifier.trainable_count(), 2);

    let x = Tensor::randn(0f32, 1.0, (2, 10, 8, 8), &device)?;
    let grads = classifier.forward(&x)?.sum_all()?.backward()?;
    for param in classifier.encoder().parameters() {
        assert!(grads.get(param.var().as_tensor()).is_none());
    }
    for param in classifier.head().parameters() {
        assert!(grads.get(param.var().as_tensor()).is_some());
    }

    classifier.encoder_mut().set_trainable(true);
    assert!(classifier.trainable_count() > 2);
    Ok(())
}

#[test]
fn mismatched_head_is_rejected() -> Result<()> {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(4);
    let net = PretrainNet::new(&build_config(), &mut rng, &device)?;
    let head = classification_head(7, 4, &mut rng, &device)?;
    assert!(net.into_classifier(head).is_err());
    Ok(())
}
