//! Histovit CLI - manage pathology foundation model checkpoints
//!
//! Examples:
//!   histovit list              # Show the model catalog
//!   histovit pull vits16       # Download a checkpoint into the cache
//!   histovit info ViT-L/14     # Architecture and artifact details

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use histovit_core::{parse_model_variant, HubConfig, ModelHub, ModelVariant, Result};

/// Histovit - pathology vision-transformer foundation models
#[derive(Parser)]
#[command(
    name = "histovit",
    about = "Pathology foundation model hub",
    version = env!("CARGO_PKG_VERSION"),
    arg_required_else_help = true,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Weights cache directory
    #[arg(long, global = true, value_name = "PATH", env = "HISTOVIT_WEIGHTS_DIR")]
    weights_dir: Option<PathBuf>,

    /// Emit machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalog variants and their cache status
    #[command(name = "list", alias = "models")]
    List,

    /// Download a variant's checkpoint into the local cache
    ///
    /// A checkpoint that is already cached is left untouched.
    #[command(name = "pull", alias = "download")]
    Pull {
        /// Model identifier, e.g. "vits16" or "ViT-S/16"
        model: String,
    },

    /// Show architecture and artifact details for a variant
    #[command(name = "info")]
    Info {
        /// Model identifier, e.g. "vitl14" or "ViT-L/14"
        model: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = HubConfig::default();
    if let Some(dir) = &cli.weights_dir {
        config.weights_dir = dir.clone();
    }

    match run(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: HubConfig) -> Result<()> {
    let hub = ModelHub::with_config(config)?;

    match cli.command {
        Commands::List => list(&hub, cli.json),
        Commands::Pull { model } => pull(&hub, &model),
        Commands::Info { model } => info(&hub, &model, cli.json),
    }
}

fn list(hub: &ModelHub, json: bool) -> Result<()> {
    if json {
        let entries: Vec<serde_json::Value> = ModelVariant::all()
            .iter()
            .map(|v| {
                serde_json::json!({
                    "name": v.display_name(),
                    "architecture": v.arch_name(),
                    "checkpoint": v.weight_filename(),
                    "cached": hub.downloader().is_cached(*v),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries).unwrap());
        return Ok(());
    }

    println!(
        "{:<10} {:<32} {:<12} {:>9}  cached",
        "NAME", "ARCHITECTURE", "CHECKPOINT", "SIZE"
    );
    for variant in ModelVariant::all() {
        let cached = if hub.downloader().is_cached(*variant) {
            "yes"
        } else {
            "no"
        };
        println!(
            "{:<10} {:<32} {:<12} {:>9}  {}",
            variant.display_name(),
            variant.arch_name(),
            variant.weight_filename(),
            human_size(variant.estimated_size()),
            cached,
        );
    }
    Ok(())
}

fn pull(hub: &ModelHub, model: &str) -> Result<()> {
    let variant = parse_model_variant(model)?;
    let path = hub.downloader().fetch(variant)?;
    println!("{} -> {}", variant.display_name(), path.display());
    Ok(())
}

fn info(hub: &ModelHub, model: &str, json: bool) -> Result<()> {
    let variant = parse_model_variant(model)?;
    let config = variant.vit_config(true);
    let cache_path = hub.downloader().weight_path(variant);

    if json {
        let value = serde_json::json!({
            "name": variant.display_name(),
            "architecture": variant.arch_name(),
            "img_size": config.img_size,
            "patch_size": config.patch_size,
            "embed_dim": config.embed_dim,
            "depth": config.depth,
            "num_heads": config.num_heads,
            "register_tokens": config.reg_tokens,
            "needs_conversion": variant.needs_dinov2_conversion(),
            "weight_url": variant.weight_url(),
            "cache_path": cache_path,
            "cached": hub.downloader().is_cached(variant),
        });
        println!("{}", serde_json::to_string_pretty(&value).unwrap());
        return Ok(());
    }

    println!("{}", variant.display_name());
    println!("  architecture:    {}", variant.arch_name());
    println!(
        "  geometry:        {}px / patch {} ({}x{} grid)",
        config.img_size,
        config.patch_size,
        config.grid_size(),
        config.grid_size()
    );
    println!(
        "  transformer:     dim {}, depth {}, {} heads, {} register token(s)",
        config.embed_dim, config.depth, config.num_heads, config.reg_tokens
    );
    println!(
        "  checkpoint:      {} (~{})",
        variant.weight_url(),
        human_size(variant.estimated_size())
    );
    if variant.needs_dinov2_conversion() {
        println!("  note:            DINOv2-native release, converted at load time");
    }
    println!(
        "  cache:           {} ({})",
        cache_path.display(),
        if hub.downloader().is_cached(variant) {
            "present"
        } else {
            "not downloaded"
        }
    );
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const GB: f64 = 1_073_741_824.0;
    const MB: f64 = 1_048_576.0;
    let bytes = bytes as f64;
    if bytes >= GB {
        format!("{:.2} GB", bytes / GB)
    } else {
        format!("{:.0} MB", bytes / MB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn human_size_picks_sensible_units() {
        assert_eq!(human_size(87_000_000), "83 MB");
        assert_eq!(human_size(1_217_000_000), "1.13 GB");
    }
}
