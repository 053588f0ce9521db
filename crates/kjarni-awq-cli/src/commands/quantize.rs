use std::path::Path;

use anyhow::{anyhow, Context, Result};
use kjarni_awq::calib::MAX_DOC_TOKENS;
use kjarni_awq::models::CONFIG_FILE;
use kjarni_awq::{
    get_calib_dataset, parse_byte_size, AnyModel, AwqPipeline, CalibrationSource, DevicePool,
    GemmVersion, ModelAdapter, QuantConfig, QuantizeOptions, RandomTokens, SearchResult, TokenFile,
};
use kjarni_awq_cli::QuantizeArgs;

pub fn run(args: &QuantizeArgs) -> Result<()> {
    let quant = match &args.quant_config {
        Some(path) => QuantConfig::from_file(path)?,
        None => {
            let version: GemmVersion = args.version.parse()?;
            QuantConfig::new(args.w_bit, args.group_size, version)?
        }
    };

    let model = AnyModel::load(&args.model)
        .with_context(|| format!("failed to load model from {}", args.model.display()))?;
    log::info!(
        "Quantizing {} model to {}-bit, group {}, {}",
        model.model_type(),
        quant.w_bit,
        quant.q_group_size,
        quant.version
    );

    match model {
        AnyModel::Llama(m) => {
            let vocab = m.config.vocab_size;
            run_pipeline(m, vocab, quant, args)
        }
        AnyModel::Mpt(m) => {
            let vocab = m.config.vocab_size;
            run_pipeline(m, vocab, quant, args)
        }
    }
}

fn run_pipeline<M: ModelAdapter>(
    model: M,
    vocab_size: usize,
    quant: QuantConfig,
    args: &QuantizeArgs,
) -> Result<()> {
    let mut pipeline = AwqPipeline::new(model, quant)?;
    if !args.device_memory.is_empty() {
        let capacities = args
            .device_memory
            .iter()
            .map(|s| parse_byte_size(s))
            .collect::<Result<Vec<_>, _>>()?;
        pipeline = pipeline.with_devices(DevicePool::new(capacities));
    }

    let mut opts = QuantizeOptions {
        n_samples: args.n_samples,
        seqlen: args.seqlen,
        auto_scale: !args.no_scale,
        mse_range: !args.no_clip,
        run_quant: !args.search_only,
        real_quant: !args.fake_quant,
        search_checkpoint: args.search_checkpoint.clone(),
        ..QuantizeOptions::default()
    };

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;

    if let Some(path) = &args.search_result {
        let result = SearchResult::load(path)?;
        println!(
            "Replaying search result from {} ({} blocks)",
            path.display(),
            result.completed_blocks
        );
        pipeline.apply_search_result(&result)?;
        opts.run_search = false;
    }

    if opts.run_search {
        let source = calibration_source(args, vocab_size)?;
        let samples = get_calib_dataset(source.as_ref(), opts.n_samples, opts.seqlen)?;
        pipeline.quantize(&samples, &opts)?;
    } else {
        pipeline.quantize_weights(opts.real_quant)?;
    }

    if args.search_only {
        let result = pipeline
            .search_result()
            .ok_or_else(|| anyhow!("search produced no result"))?;
        let path = result.save_to_dir(&args.output)?;
        println!("Search result written to {}", path.display());
        return Ok(());
    }

    let shard_size = parse_byte_size(&args.shard_size)?;
    let files = pipeline.save_quantized(&args.output, shard_size)?;
    copy_model_config(&args.model, &args.output)?;
    println!(
        "Wrote {} checkpoint file(s) to {}",
        files.len(),
        args.output.display()
    );
    Ok(())
}

fn calibration_source(args: &QuantizeArgs, vocab_size: usize) -> Result<Box<dyn CalibrationSource>> {
    if let Some(path) = &args.calib {
        return Ok(Box::new(TokenFile::new(path)));
    }
    let seed = match args.random_calib {
        Some(seed) => seed,
        None => {
            log::warn!("No --calib file given, using random calibration tokens");
            0
        }
    };
    Ok(Box::new(RandomTokens {
        vocab_size: u32::try_from(vocab_size)?,
        n_docs: args.n_samples,
        doc_len: args.seqlen.min(MAX_DOC_TOKENS),
        seed,
    }))
}

fn copy_model_config(model_dir: &Path, output: &Path) -> Result<()> {
    let src = model_dir.join(CONFIG_FILE);
    let dst = output.join(CONFIG_FILE);
    std::fs::copy(&src, &dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}
