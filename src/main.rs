//! hotswap-cache maintenance CLI.
//!
//! Encodes, decodes and inspects compression containers and prints the
//! effective configuration. The caches themselves are a library.

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use hotswap_cache::cache::compressor::{Codec, Compressor, HEADER_LEN};
use hotswap_cache::config::{Cli, Command, Config};

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "hotswap_cache=debug"
    } else {
        "hotswap_cache=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("hotswap-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Compress {
            input,
            output,
            codec,
            level,
        } => compress(&config, &input, &output, codec, level),
        Command::Decompress { input, output } => decompress(&config, &input, &output),
        Command::Inspect { input } => inspect(&input),
        Command::Codecs => {
            let compressor = Compressor::new(config.compression.clone());
            for codec in Codec::ALL {
                let state = if compressor.is_available(codec) {
                    "available"
                } else {
                    "disabled"
                };
                println!(
                    "{:>2}  {:<10} {:<10} default level {}",
                    codec.tag(),
                    codec.to_string(),
                    state,
                    codec.default_level()
                );
            }
            Ok(())
        }
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn compress(
    config: &Config,
    input: &Path,
    output: &Path,
    codec: Option<Codec>,
    level: Option<i32>,
) -> anyhow::Result<()> {
    let data =
        std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let compressor = Compressor::new(config.compression.clone());
    let encoded = compressor.encode_with(
        &data,
        codec.unwrap_or(config.compression.codec),
        level.unwrap_or(config.compression.level),
    )?;
    std::fs::write(output, &encoded.data)
        .with_context(|| format!("writing {}", output.display()))?;

    info!(
        input = %input.display(),
        output = %output.display(),
        codec = %encoded.codec,
        original = encoded.original_size,
        compressed = encoded.compressed_size(),
        ratio = encoded.ratio(),
        elapsed_ms = encoded.elapsed.as_secs_f64() * 1000.0,
        "Compressed"
    );
    Ok(())
}

fn decompress(config: &Config, input: &Path, output: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let compressor = Compressor::new(config.compression.clone());
    let data = compressor
        .decode(&raw)
        .with_context(|| format!("decoding {}", input.display()))?;
    std::fs::write(output, &data).with_context(|| format!("writing {}", output.display()))?;
    info!(output = %output.display(), size = data.len(), "Decompressed");
    Ok(())
}

fn inspect(input: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let header = Compressor::read_header(&raw)?;
    let codec = header
        .codec()
        .map_or_else(|| format!("unknown ({})", header.codec_tag()), |c| c.to_string());
    let payload = raw.len() - HEADER_LEN;

    println!("version:       {}", header.version());
    println!("codec:         {codec}");
    println!("flags:         {:#06x}", header.flags());
    println!("original size: {}", header.original_size());
    println!("payload size:  {payload}");
    if payload > 0 {
        println!(
            "ratio:         {:.2}",
            header.original_size() as f64 / raw.len() as f64
        );
    }
    Ok(())
}
