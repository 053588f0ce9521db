mod common;

use common::{all_tokens, ToyModel};
use kjarni_awq::utils::{cosine_similarity, mse};
use kjarni_awq::{
    AwqError, AwqPipeline, CancellationToken, DevicePool, GemmVersion, ModelAdapter, QuantConfig,
    QuantizeOptions, SearchConfig, SearchResult,
};

fn quant() -> QuantConfig {
    QuantConfig::new(4, 4, GemmVersion::Gemm).unwrap()
}

/// The toy shapes are too narrow for 4-bit words, so quantization is
/// simulated.
fn fake_quant() -> QuantizeOptions {
    QuantizeOptions {
        real_quant: false,
        ..QuantizeOptions::default()
    }
}

#[test]
fn test_toy_model_output_survives_quantization() {
    let samples = all_tokens();
    let reference = ToyModel::random(1).forward_blocks(&samples).unwrap();

    let mut pipeline = AwqPipeline::new(ToyModel::random(1), quant()).unwrap();
    pipeline.quantize(&samples, &fake_quant()).unwrap();
    let model = pipeline.into_model();
    for (block, original) in model.layers().iter().zip(ToyModel::random(1).layers()) {
        assert!(!block.up.is_packed());
        assert_ne!(block.up, original.up);
    }

    let out = model.forward_blocks(&samples).unwrap();
    let cos = cosine_similarity(&reference, &out);
    assert!(cos > 0.98, "cosine similarity {}", cos);
}

#[test]
fn test_outlier_weight_needs_activation_awareness() {
    let samples = all_tokens();
    let reference = ToyModel::with_outlier().forward_blocks(&samples).unwrap();

    let rtn = QuantizeOptions {
        run_search: false,
        ..fake_quant()
    };
    let mut pipeline = AwqPipeline::new(ToyModel::with_outlier(), quant()).unwrap();
    pipeline.quantize(&samples, &rtn).unwrap();
    let rtn_cos = cosine_similarity(&reference, &pipeline.model().forward_blocks(&samples).unwrap());
    assert!(rtn_cos < 0.9, "round-to-nearest cosine {}", rtn_cos);

    let mut pipeline = AwqPipeline::new(ToyModel::with_outlier(), quant()).unwrap();
    pipeline.quantize(&samples, &fake_quant()).unwrap();
    let awq_cos = cosine_similarity(&reference, &pipeline.model().forward_blocks(&samples).unwrap());
    assert!(awq_cos > 0.98, "searched cosine {}", awq_cos);
}

#[test]
fn test_clip_search_removes_reachable_outlier_error() {
    let samples = all_tokens();
    let reference = ToyModel::with_clippable_outlier().forward_blocks(&samples).unwrap();
    let scale_off = QuantizeOptions {
        auto_scale: false,
        ..fake_quant()
    };

    let mut unclipped = AwqPipeline::new(ToyModel::with_clippable_outlier(), quant()).unwrap();
    unclipped
        .quantize(
            &samples,
            &QuantizeOptions {
                mse_range: false,
                ..scale_off.clone()
            },
        )
        .unwrap();
    let unclipped_out = unclipped.model().forward_blocks(&samples).unwrap();

    let mut clipped = AwqPipeline::new(ToyModel::with_clippable_outlier(), quant()).unwrap();
    clipped.quantize(&samples, &scale_off).unwrap();
    let clipped_out = clipped.model().forward_blocks(&samples).unwrap();

    let record = &clipped.search_result().unwrap().clip[0];
    assert_eq!(record.linear_name, "blocks.0.up");
    assert_eq!(record.max_val[[0, 0]], 15.0);
    assert_eq!(record.max_val[[1, 0]], 1.25);

    let unclipped_mse = mse(&reference, &unclipped_out);
    let clipped_mse = mse(&reference, &clipped_out);
    assert!(unclipped_mse > 0.1, "unclipped mse {}", unclipped_mse);
    assert!(clipped_mse < 1e-10, "clipped mse {}", clipped_mse);

    let unclipped_cos = cosine_similarity(&reference, &unclipped_out);
    let clipped_cos = cosine_similarity(&reference, &clipped_out);
    assert!(unclipped_cos < 0.995, "unclipped cosine {}", unclipped_cos);
    assert!(clipped_cos > 0.9999, "clipped cosine {}", clipped_cos);
}

#[test]
fn test_zero_shrink_search_keeps_weights_unclipped() {
    let samples = all_tokens();
    let opts = QuantizeOptions {
        search: SearchConfig {
            max_shrink: 0.0,
            ..SearchConfig::default()
        },
        ..QuantizeOptions::default()
    };
    let mut pipeline = AwqPipeline::new(ToyModel::random(1), quant()).unwrap();
    let result = pipeline.search(&samples, &opts).unwrap();
    assert_eq!(result.completed_blocks, 2);
    assert!(!result.clip.is_empty());

    let mut unscaled = AwqPipeline::new(ToyModel::random(1), quant()).unwrap();
    let no_scale = QuantizeOptions {
        auto_scale: false,
        ..opts
    };
    let result = unscaled.search(&samples, &no_scale).unwrap();
    let original = ToyModel::random(1);
    for (block, before) in unscaled.model().layers().iter().zip(original.layers()) {
        assert_eq!(block.up, before.up);
        assert_eq!(block.down, before.down);
    }
    assert!(!result.clip.is_empty());
}

#[test]
fn test_narrow_layers_cannot_pack_four_bit_words() {
    let mut pipeline = AwqPipeline::new(ToyModel::random(9), quant()).unwrap();
    let err = pipeline
        .quantize(&all_tokens(), &QuantizeOptions::default())
        .unwrap_err();
    assert!(matches!(err, AwqError::Config(_)));
}

#[test]
fn test_search_is_deterministic() {
    let samples = all_tokens();
    let opts = QuantizeOptions::default();
    let a = AwqPipeline::new(ToyModel::random(2), quant())
        .unwrap()
        .search(&samples, &opts)
        .unwrap();
    let b = AwqPipeline::new(ToyModel::random(2), quant())
        .unwrap()
        .search(&samples, &opts)
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.completed_blocks, 2);
    assert!(a.scale.iter().any(|r| r.prev_op_name == "blocks.1.act"));
}

#[test]
fn test_search_can_be_disabled_piecewise() {
    let samples = all_tokens();
    let opts = QuantizeOptions {
        auto_scale: false,
        ..QuantizeOptions::default()
    };
    let result = AwqPipeline::new(ToyModel::random(3), quant())
        .unwrap()
        .search(&samples, &opts)
        .unwrap();
    assert!(result.scale.is_empty());
    assert!(!result.clip.is_empty());

    let opts = QuantizeOptions {
        mse_range: false,
        ..QuantizeOptions::default()
    };
    let result = AwqPipeline::new(ToyModel::random(3), quant())
        .unwrap()
        .search(&samples, &opts)
        .unwrap();
    assert!(!result.scale.is_empty());
    assert!(result.clip.is_empty());
}

#[test]
fn test_replayed_result_matches_searched_model() {
    let samples = all_tokens();
    let dir = tempfile::tempdir().unwrap();

    let mut searched = AwqPipeline::new(ToyModel::random(4), quant()).unwrap();
    let result = searched.search(&samples, &QuantizeOptions::default()).unwrap();
    let path = result.save_to_dir(dir.path()).unwrap();

    let mut replayed = AwqPipeline::new(ToyModel::random(4), quant()).unwrap();
    replayed.apply_search_result(&SearchResult::load(&path).unwrap()).unwrap();

    for (a, b) in searched.model().layers().iter().zip(replayed.model().layers()) {
        assert_eq!(a.up, b.up);
        assert_eq!(a.down, b.down);
        assert_eq!(a.norm, b.norm);
        assert_eq!(a.act, b.act);
    }
}

#[test]
fn test_resume_from_partial_checkpoint() {
    let samples = all_tokens();
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("search.bin");

    let full = AwqPipeline::new(ToyModel::random(5), quant())
        .unwrap()
        .search(&samples, &QuantizeOptions::default())
        .unwrap();

    let mut partial = SearchResult::default();
    let (scale, clip) = full.for_block("blocks.0.");
    partial.push_block("blocks.0.", &scale, &clip);
    partial.save(&checkpoint).unwrap();

    let opts = QuantizeOptions {
        search_checkpoint: Some(checkpoint.clone()),
        ..QuantizeOptions::default()
    };
    let resumed = AwqPipeline::new(ToyModel::random(5), quant())
        .unwrap()
        .search(&samples, &opts)
        .unwrap();
    assert_eq!(resumed, full);
    assert_eq!(SearchResult::load(&checkpoint).unwrap(), full);
}

#[test]
fn test_cancellation_keeps_partial_result() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("search.bin");
    let (token, handle) = CancellationToken::new();
    handle.cancel();

    let opts = QuantizeOptions {
        search_checkpoint: Some(checkpoint.clone()),
        ..QuantizeOptions::default()
    };
    let mut pipeline = AwqPipeline::new(ToyModel::random(6), quant())
        .unwrap()
        .with_cancellation(token);
    let err = pipeline.search(&all_tokens(), &opts).unwrap_err();
    assert!(matches!(err, AwqError::Cancelled { completed_blocks: 0 }));
    assert_eq!(pipeline.search_result().unwrap().completed_blocks, 0);
    assert!(checkpoint.exists());
}

#[test]
fn test_block_too_large_for_device() {
    // Embeddings (512 bytes) fit; block 0 with its captures (2080 bytes) does not.
    let mut pipeline = AwqPipeline::new(ToyModel::random(7), quant())
        .unwrap()
        .with_devices(DevicePool::new(vec![1024]));
    let err = pipeline
        .search(&all_tokens(), &QuantizeOptions::default())
        .unwrap_err();
    match err {
        AwqError::ResourceExhausted {
            block,
            device,
            required,
            available,
        } => {
            assert_eq!((block, device), (0, 0));
            assert_eq!(required, 2080);
            assert_eq!(available, 1024);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_two_devices_hold_one_block_at_a_time() {
    let mut pipeline = AwqPipeline::new(ToyModel::random(8), quant())
        .unwrap()
        .with_devices(DevicePool::new(vec![2100, 2100]));
    let result = pipeline
        .search(&all_tokens(), &QuantizeOptions::default())
        .unwrap();
    assert_eq!(result.completed_blocks, 2);
}
