use candle_core::Device;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{info, warn};

use crate::rank::{ranked, score_images};
use crate::{
    DecodedImage, Decoder, Error, Generator, ModelHandle, PromptEncoder, Result, Sampler,
    SamplingFailure, SamplingParams, Samples, ScoredImage, Scorer, SeedState,
};

const DEFAULT_IMAGE_TOKENS: usize = 256;
const DEFAULT_IMAGE_SIZE: usize = 256;

/// Ranked output of one request.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Images in rank order when scored, production order otherwise
    pub images: Vec<DecodedImage>,
    /// Scores parallel to `images`
    pub scores: Option<Vec<f32>>,
    /// Production index of each entry of `images`
    pub indices: Vec<usize>,
    pub rounds: usize,
    pub seed: u64,
}

pub struct Pipeline {
    generator: ModelHandle<dyn Generator>,
    decoder: ModelHandle<dyn Decoder>,
    scorer: Option<ModelHandle<dyn Scorer>>,
    encoder: PromptEncoder,
    devices: Vec<Device>,
    pool: ThreadPool,
    image_token_count: usize,
    image_size: usize,
}

impl Pipeline {
    pub fn new(
        generator: ModelHandle<dyn Generator>,
        decoder: ModelHandle<dyn Decoder>,
        scorer: Option<ModelHandle<dyn Scorer>>,
        encoder: PromptEncoder,
        devices: Vec<Device>,
    ) -> Result<Self> {
        let width = devices.len();
        if width == 0 {
            return Err(Error::Config("pipeline needs at least one device".into()));
        }
        for (role, count) in [
            ("generator", generator.replica_count()),
            ("decoder", decoder.replica_count()),
        ] {
            if count != width {
                return Err(Error::Config(format!(
                    "{role} has {count} replicas for {width} devices"
                )));
            }
        }
        if let Some(scorer) = &scorer {
            if scorer.replica_count() == 0 {
                return Err(Error::Config("scorer has no replicas".into()));
            }
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(width)
            .thread_name(|i| format!("mosaic-device-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to build device pool: {e}")))?;
        Ok(Self {
            generator,
            decoder,
            scorer,
            encoder,
            devices,
            pool,
            image_token_count: DEFAULT_IMAGE_TOKENS,
            image_size: DEFAULT_IMAGE_SIZE,
        })
    }

    /// Overrides the generator token count and the square output size.
    pub fn with_image_shape(mut self, image_token_count: usize, image_size: usize) -> Self {
        self.image_token_count = image_token_count;
        self.image_size = image_size;
        self
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Encodes the prompt and runs the sampling rounds, without ranking.
    pub fn sample(
        &self,
        prompt: &str,
        params: &SamplingParams,
    ) -> std::result::Result<Samples, SamplingFailure> {
        let early = |source| SamplingFailure {
            partial: Vec::new(),
            rounds_completed: 0,
            rounds_planned: 0,
            source,
        };
        params.validate().map_err(early)?;
        let tokenized = self.encoder.encode(&[prompt]).map_err(early)?;
        let replicated = tokenized.replicate(&self.devices).map_err(early)?;
        let seed = params.seed.map(SeedState::new).unwrap_or_else(SeedState::random);

        let sampler = Sampler::new(
            &self.generator,
            &self.decoder,
            &self.pool,
            self.image_token_count,
            self.image_size,
        )
        .map_err(early)?;
        sampler.sample(&replicated, params.n_predictions, params, seed)
    }

    pub fn run(&self, prompt: &str, params: &SamplingParams) -> Result<Generation> {
        let samples = self.sample(prompt, params).map_err(|failure| {
            if !failure.partial.is_empty() {
                warn!(
                    partial = failure.partial.len(),
                    rounds = failure.rounds_completed,
                    "discarding images from completed rounds"
                );
            }
            Error::from(failure)
        })?;
        let samples = samples.apply(params.excess);
        let Samples {
            images,
            rounds,
            seed,
            ..
        } = samples;

        let scorer = match (&self.scorer, params.score) {
            (Some(scorer), true) => scorer,
            _ => {
                let indices = (0..images.len()).collect();
                return Ok(Generation {
                    images,
                    scores: None,
                    indices,
                    rounds,
                    seed,
                });
            }
        };

        let scores = score_images(scorer, &self.pool, prompt, &images)?;
        let scored = ranked(images, &scores)?;
        let mut ranked_images = Vec::with_capacity(scored.len());
        let mut ranked_scores = Vec::with_capacity(scored.len());
        let mut order = Vec::with_capacity(scored.len());
        for ScoredImage { image, score, index } in scored {
            ranked_images.push(image);
            ranked_scores.push(score);
            order.push(index);
        }
        info!(
            images = ranked_images.len(),
            best = ranked_scores.first().copied().unwrap_or_default(),
            "ranked images"
        );
        Ok(Generation {
            images: ranked_images,
            scores: Some(ranked_scores),
            indices: order,
            rounds,
            seed,
        })
    }
}
