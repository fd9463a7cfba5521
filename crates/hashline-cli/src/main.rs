//! Binary entrypoint: runs the standard signer chain over the given items.
//!
//! ```text
//! hashline 0 1 1 2 3 5 8
//! echo '[0, 1, "bb"]' | hashline
//! ```
use anyhow::Context;
use hashline_core::{Item, PipelineConfig, RunContext};
use hashline_stages::signer_pipeline;
use std::io::Read;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // A YAML file named by HASHLINE_CONFIG wins over individual variables
    let config = match std::env::var("HASHLINE_CONFIG") {
        Ok(path) => PipelineConfig::from_yaml_file(&path)?,
        Err(_) => PipelineConfig::from_env()?,
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let seed = if args.is_empty() {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("reading items from stdin")?;
        parse_json_seed(&raw)?
    } else {
        parse_args(&args)
    };

    let runner = signer_pipeline(&config)?;
    let ctx = RunContext::new(&config);

    let token = ctx.cancellation().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling run");
            token.cancel();
        }
    });

    let output = runner.run(seed, &ctx).await?;
    if std::env::var_os("HASHLINE_REPORT").is_some() {
        eprintln!("{}", serde_json::to_string_pretty(&output.report)?);
    }
    println!("{}", output.into_single()?);
    Ok(())
}

/// Integers stay integers, everything else is text.
fn parse_args(args: &[String]) -> Vec<Item> {
    args.iter()
        .map(|arg| match arg.parse::<i64>() {
            Ok(n) => Item::Int(n),
            Err(_) => Item::Text(arg.clone()),
        })
        .collect()
}

fn parse_json_seed(raw: &str) -> anyhow::Result<Vec<Item>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).context("stdin must be a JSON array of numbers, strings or byte arrays")
}
