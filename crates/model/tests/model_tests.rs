use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{greedy_decode, GenerationConfig, Model, ModelConfig, Seq2SeqInputs, Seq2SeqModel};

fn build_config() -> ModelConfig {
    let mut config = ModelConfig::new(16, 8, 3);
    config.seed = 7;
    config
}

fn inputs() -> Result<(Tensor, Tensor, Tensor)> {
    let device = Device::Cpu;
    let input_ids = Tensor::from_slice(&[3u32, 4, 5, 0, 6, 7, 8, 9], (2, 4), &device)?;
    let mask = Tensor::from_slice(&[1u32, 1, 1, 0, 1, 1, 1, 1], (2, 4), &device)?;
    let decoder = Tensor::from_slice(&[1u32, 3, 4, 1, 6, 7], (2, 3), &device)?;
    Ok((input_ids, mask, decoder))
}

#[test]
fn forward_produces_logits() -> Result<()> {
    let model = Model::new(build_config())?;
    let (input_ids, attention_mask, decoder_input_ids) = inputs()?;

    let output = model.forward(&Seq2SeqInputs {
        input_ids: &input_ids,
        attention_mask: &attention_mask,
        decoder_input_ids: &decoder_input_ids,
    })?;

    assert_eq!(output.logits.dims(), &[2, 3, 16]);
    assert_eq!(output.logits.dtype(), DType::F32);
    assert_eq!(output.hidden_states.len(), 3);
    assert_eq!(output.cross_attentions[0].dims(), &[2, 3, 4]);
    assert!(output.auxiliary_logits.is_empty());
    assert!(output.domain_logits.is_none());
    assert!(output.moe_loss.is_none());
    assert!(output.temperature.is_none());
    Ok(())
}

#[test]
fn padding_receives_no_attention() -> Result<()> {
    let model = Model::new(build_config())?;
    let (input_ids, attention_mask, decoder_input_ids) = inputs()?;

    let output = model.forward(&Seq2SeqInputs {
        input_ids: &input_ids,
        attention_mask: &attention_mask,
        decoder_input_ids: &decoder_input_ids,
    })?;

    let attention = output.cross_attentions[2].to_vec3::<f32>()?;
    for row in &attention[0] {
        assert!(row[3] < 1e-6);
        let total: f32 = row.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn optional_heads_are_reported() -> Result<()> {
    let mut config = build_config();
    config.auxiliary_layers = vec![0, 1];
    config.num_domains = 3;
    config.num_experts = 2;
    config.learn_temperature = true;
    let model = Model::new(config)?;
    let (input_ids, attention_mask, decoder_input_ids) = inputs()?;

    let output = model.forward(&Seq2SeqInputs {
        input_ids: &input_ids,
        attention_mask: &attention_mask,
        decoder_input_ids: &decoder_input_ids,
    })?;

    assert_eq!(output.auxiliary_logits.len(), 2);
    assert_eq!(output.domain_logits.as_ref().map(|t| t.dims().to_vec()), Some(vec![2, 3]));
    let balance = output.moe_loss.expect("moe loss").to_vec0::<f32>()?;
    assert!(balance >= 1.0 - 1e-5);
    let temperature = output.temperature.expect("temperature").to_vec0::<f32>()?;
    assert!((temperature - 1.0).abs() < 1e-6);
    assert!(model
        .named_parameters()
        .iter()
        .any(|(name, _)| name == "log_temperature"));
    Ok(())
}

#[test]
fn learned_temperature_stays_positive() -> Result<()> {
    let mut config = build_config();
    config.learn_temperature = true;
    config.softmax_temperature = 2.0;
    let model = Model::new(config)?;
    let (_, log_t) = model
        .named_parameters()
        .into_iter()
        .find(|(name, _)| name == "log_temperature")
        .expect("log temperature");
    let (input_ids, attention_mask, decoder_input_ids) = inputs()?;

    for (value, expected) in [(-50.0f32, 2.0 * (-50.0f32).exp()), (0.5, 2.0 * 0.5f32.exp())] {
        log_t.set(&Tensor::new(&[value], log_t.device())?)?;
        let output = model.forward(&Seq2SeqInputs {
            input_ids: &input_ids,
            attention_mask: &attention_mask,
            decoder_input_ids: &decoder_input_ids,
        })?;
        let temperature = output.temperature.expect("temperature").to_vec0::<f32>()?;
        assert!(temperature > 0.0);
        assert!((temperature - expected).abs() <= expected * 1e-5);
    }
    Ok(())
}

#[test]
fn same_seed_builds_identical_replicas() -> Result<()> {
    let left = Model::new(build_config())?;
    let right = Model::new(build_config())?;
    for ((name_l, var_l), (name_r, var_r)) in left
        .named_parameters()
        .into_iter()
        .zip(right.named_parameters())
    {
        assert_eq!(name_l, name_r);
        let l = var_l.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        let r = var_r.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(l, r);
    }
    Ok(())
}

#[test]
fn greedy_decode_respects_length_bounds() -> Result<()> {
    let model = Model::new(build_config())?;
    model.set_training(false);
    let (input_ids, attention_mask, _) = inputs()?;
    let config = GenerationConfig {
        decoder_start_id: 1,
        eos_id: 2,
        pad_id: 0,
        max_length: 5,
        min_length: 2,
    };

    let decoded = greedy_decode(&model, &input_ids, &attention_mask, &config)?;

    assert_eq!(decoded.len(), 2);
    for sequence in decoded {
        assert!(sequence.len() >= 2);
        assert!(sequence.len() <= 5);
        assert!(!sequence.contains(&2));
    }
    Ok(())
}
