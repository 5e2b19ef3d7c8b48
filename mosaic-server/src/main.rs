use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mosaic_core::{
    format_score, load_pipeline, DeviceMap, ExcessPolicy, ModelConfig, PipelineConfig, Resolver,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod server;

#[derive(Parser, Debug)]
#[command(author, version, about = "Mosaic text-to-image sampling server")]
struct Cli {
    #[command(flatten)]
    pipeline: PipelineArgs,

    #[command(subcommand)]
    command: Command,
}

/// Overrides applied on top of the config file.
#[derive(Args, Debug)]
struct PipelineArgs {
    /// YAML or JSON pipeline config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Devices to replicate onto, e.g. `cuda:0,1` or `cpu:4`
    #[arg(long, global = true)]
    devices: Option<DeviceMap>,

    /// Use CPU instead of GPU
    #[arg(long, global = true, conflicts_with = "devices")]
    cpu: bool,

    /// Generator model identifier
    #[arg(long, global = true)]
    generator: Option<String>,

    /// Decoder model identifier
    #[arg(long, global = true)]
    decoder: Option<String>,

    /// Scorer model identifier
    #[arg(long, global = true)]
    scorer: Option<String>,

    /// Skip loading the scorer
    #[arg(long, global = true, conflicts_with = "scorer")]
    no_scorer: bool,

    /// Root of the local artifact store
    #[arg(long, global = true)]
    artifact_root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP generation endpoint
    Serve {
        /// Host address to bind the server to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind the server to
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },

    /// Generate images for one prompt and write them as PNGs
    Generate {
        #[arg(long)]
        prompt: String,

        /// Number of images to request
        #[arg(long)]
        n: Option<usize>,

        /// Output directory
        #[arg(long, default_value = "output")]
        out: PathBuf,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        top_p: Option<f64>,

        #[arg(long)]
        temperature: Option<f64>,

        #[arg(long)]
        condition_scale: Option<f64>,

        /// `keep` or `truncate` the images past `n`
        #[arg(long)]
        excess: Option<ExcessPolicy>,

        /// Write images in production order without scoring
        #[arg(long)]
        no_score: bool,
    },
}

impl PipelineArgs {
    fn into_config(self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if self.cpu {
            config.devices = DeviceMap::ForceCpu { replicas: 1 };
        } else if let Some(devices) = self.devices {
            config.devices = devices;
        }
        if let Some(id) = self.generator {
            config.models.generator.id = id;
        }
        if let Some(id) = self.decoder {
            config.models.decoder.id = id;
        }
        if self.no_scorer {
            config.models.scorer = None;
        } else if let Some(id) = self.scorer {
            match &mut config.models.scorer {
                Some(scorer) => scorer.id = id,
                None => config.models.scorer = Some(ModelConfig::new(id)),
            }
        }
        if let Some(root) = self.artifact_root {
            config.artifact_root = root;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mosaic_core=info,mosaic_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.pipeline.into_config()?;
    let resolver = Resolver::new(&config.artifact_root);
    let pipeline = load_pipeline(&config, &resolver)
        .await
        .context("failed to load pipeline")?;

    match cli.command {
        Command::Serve { host, port } => {
            server::serve(pipeline, config.sampling, &format!("{host}:{port}")).await
        }
        Command::Generate {
            prompt,
            n,
            out,
            seed,
            top_k,
            top_p,
            temperature,
            condition_scale,
            excess,
            no_score,
        } => {
            let mut params = config.sampling.clone();
            if let Some(n) = n {
                params.n_predictions = n;
            }
            params.seed = seed.or(params.seed);
            params.top_k = top_k.or(params.top_k);
            params.top_p = top_p.or(params.top_p);
            params.temperature = temperature.or(params.temperature);
            if let Some(scale) = condition_scale {
                params.condition_scale = scale;
            }
            if let Some(excess) = excess {
                params.excess = excess;
            }
            params.score &= !no_score;

            let generation = tokio::task::spawn_blocking(move || pipeline.run(&prompt, &params))
                .await
                .context("generation task panicked")??;
            info!(seed = generation.seed, rounds = generation.rounds, "generation finished");

            std::fs::create_dir_all(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            for (rank, img) in generation.images.iter().enumerate() {
                let path = out.join(format!("{rank:02}.png"));
                img.to_dynamic()
                    .save_with_format(&path, image::ImageFormat::Png)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                match &generation.scores {
                    Some(scores) => println!("{rank:02}  {}", format_score(scores[rank])),
                    None => println!("{rank:02}"),
                }
            }
            Ok(())
        }
    }
}
