//! Replicated sampling loop
//!
//! `n` samples on `d` devices take `ceil(n / d)` rounds. Each round splits
//! the seed state into one seed per device, runs generate, control-token
//! strip and decode on every device in parallel, and waits for all of them
//! before the next round starts.

use std::time::Instant;

use candle_core::Tensor;
use rayon::prelude::*;
use rayon::ThreadPool;
use thiserror::Error;
use tracing::{debug, info};

use crate::decoded::images_from_batch;
use crate::error::boxed;
use crate::{
    DecodedImage, Decoder, Error, ExcessPolicy, Generator, ModelHandle, PromptTensors, Result,
    SamplingParams, SeedState,
};

/// Drops the leading control token from a `(rows, 1 + image_token_count)` batch.
///
/// Any other width, including an already stripped batch, is rejected.
pub fn strip_control_token(tokens: &Tensor, image_token_count: usize) -> Result<Tensor> {
    let (_, len) = tokens.dims2()?;
    let expected = image_token_count + 1;
    if len != expected {
        return Err(Error::TokenLength {
            expected,
            found: len,
        });
    }
    Ok(tokens.narrow(1, 1, image_token_count)?)
}

/// Number of rounds needed for `n` samples on `devices` devices.
pub fn rounds_for(n: usize, devices: usize) -> usize {
    n.div_ceil(devices)
}

/// Images from every completed round, in production order
/// (round, then device, then prompt row).
#[derive(Debug, Clone)]
pub struct Samples {
    pub images: Vec<DecodedImage>,
    pub rounds: usize,
    pub seed: u64,
    rows: usize,
    requested: usize,
}

impl Samples {
    /// Applies the excess policy; truncation keeps the first `requested`
    /// samples of every prompt row.
    pub fn apply(mut self, policy: ExcessPolicy) -> Self {
        if policy == ExcessPolicy::Truncate {
            let rows = self.rows.max(1);
            let requested = self.requested;
            let mut taken = vec![0usize; rows];
            self.images = std::mem::take(&mut self.images)
                .into_iter()
                .enumerate()
                .filter_map(|(i, image)| {
                    let row = i % rows;
                    (taken[row] < requested).then(|| {
                        taken[row] += 1;
                        image
                    })
                })
                .collect();
        }
        self
    }
}

/// A run that aborted. `partial` holds the images of the rounds that
/// completed before the failure, never the full requested count.
#[derive(Debug, Error)]
#[error("sampling stopped after {rounds_completed} of {rounds_planned} rounds: {source}")]
pub struct SamplingFailure {
    pub partial: Vec<DecodedImage>,
    pub rounds_completed: usize,
    pub rounds_planned: usize,
    #[source]
    pub source: Error,
}

impl From<SamplingFailure> for Error {
    fn from(failure: SamplingFailure) -> Self {
        failure.source
    }
}

pub struct Sampler<'a> {
    generator: &'a ModelHandle<dyn Generator>,
    decoder: &'a ModelHandle<dyn Decoder>,
    pool: &'a ThreadPool,
    image_token_count: usize,
    image_size: usize,
}

impl<'a> Sampler<'a> {
    pub fn new(
        generator: &'a ModelHandle<dyn Generator>,
        decoder: &'a ModelHandle<dyn Decoder>,
        pool: &'a ThreadPool,
        image_token_count: usize,
        image_size: usize,
    ) -> Result<Self> {
        let devices = generator.replica_count();
        if devices == 0 {
            return Err(Error::Config("generator has no replicas".into()));
        }
        if decoder.replica_count() != devices {
            return Err(Error::Config(format!(
                "generator has {devices} replicas but decoder has {}",
                decoder.replica_count()
            )));
        }
        Ok(Self {
            generator,
            decoder,
            pool,
            image_token_count,
            image_size,
        })
    }

    pub fn devices(&self) -> usize {
        self.generator.replica_count()
    }

    /// Runs `ceil(n / d)` rounds for the replicated `prompt`.
    ///
    /// Returns every image the rounds produced, `rounds * d` per prompt row.
    pub fn sample(
        &self,
        prompt: &[PromptTensors],
        n: usize,
        params: &SamplingParams,
        seed: SeedState,
    ) -> std::result::Result<Samples, SamplingFailure> {
        let devices = self.devices();
        let planned = rounds_for(n, devices);
        let fail = |partial, rounds_completed, source| SamplingFailure {
            partial,
            rounds_completed,
            rounds_planned: planned,
            source,
        };
        if n == 0 {
            return Err(fail(
                Vec::new(),
                0,
                Error::Config("n_predictions must be greater than 0".into()),
            ));
        }
        if prompt.len() != devices {
            return Err(fail(
                Vec::new(),
                0,
                Error::Config(format!(
                    "prompt replicated {} times for {devices} devices",
                    prompt.len()
                )),
            ));
        }
        let rows = match prompt[0].input_ids.dim(0) {
            Ok(rows) => rows,
            Err(e) => return Err(fail(Vec::new(), 0, e.into())),
        };

        let run_seed = seed.seed();
        info!(n, devices, rounds = planned, seed = run_seed, "starting sampling run");
        let mut state = seed;
        let mut images = Vec::with_capacity(planned * devices * rows);
        for round in 0..planned {
            let started = Instant::now();
            let (seeds, next) = match state.split(devices) {
                Ok(split) => split,
                Err(e) => return Err(fail(images, round, e)),
            };
            state = next;
            match self.round(prompt, &seeds, params) {
                Ok(batches) => images.extend(batches.into_iter().flatten()),
                Err(e) => return Err(fail(images, round, e)),
            }
            info!(
                round = round + 1,
                of = planned,
                images = images.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "round complete"
            );
        }

        Ok(Samples {
            images,
            rounds: planned,
            seed: run_seed,
            rows,
            requested: n,
        })
    }

    /// One lock-step round: every device generates and decodes, and the
    /// collect waits for all of them.
    fn round(
        &self,
        prompt: &[PromptTensors],
        seeds: &[u64],
        params: &SamplingParams,
    ) -> Result<Vec<Vec<DecodedImage>>> {
        self.pool.install(|| {
            (0..self.devices())
                .into_par_iter()
                .map(|replica| self.run_replica(replica, &prompt[replica], seeds[replica], params))
                .collect()
        })
    }

    fn run_replica(
        &self,
        replica: usize,
        prompt: &PromptTensors,
        seed: u64,
        params: &SamplingParams,
    ) -> Result<Vec<DecodedImage>> {
        let generation_err = |source: Error| Error::Generation {
            replica,
            source: Box::new(source),
        };
        let decode_err = |source: Error| Error::Decode {
            replica,
            source: Box::new(source),
        };
        let rows = prompt.input_ids.dim(0)?;
        let encoded = self
            .generator
            .replica(replica)
            .generate(prompt, seed, params)
            .map_err(|e| Error::Generation {
                replica,
                source: boxed(e),
            })?;
        let generated = encoded.dim(0).map_err(|e| generation_err(e.into()))?;
        if generated != rows {
            return Err(generation_err(Error::BatchSize {
                expected: rows,
                found: generated,
            }));
        }
        let tokens = strip_control_token(&encoded, self.image_token_count).map_err(decode_err)?;
        let decoded = self
            .decoder
            .replica(replica)
            .decode(&tokens)
            .map_err(|e| Error::Decode {
                replica,
                source: boxed(e),
            })?;
        let images =
            images_from_batch(&decoded, self.image_size, self.image_size).map_err(decode_err)?;
        if images.len() != rows {
            return Err(decode_err(Error::BatchSize {
                expected: rows,
                found: images.len(),
            }));
        }
        debug!(replica, seed, images = images.len(), "replica finished");
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use rstest::rstest;

    use super::*;

    #[test]
    fn strips_exactly_one_leading_token() -> Result<()> {
        let tokens = Tensor::new(&[[16384u32, 1, 2, 3], [16384, 4, 5, 6]], &Device::Cpu)?;
        let stripped = strip_control_token(&tokens, 3)?;
        assert_eq!(stripped.to_vec2::<u32>()?, vec![vec![1, 2, 3], vec![4, 5, 6]]);
        Ok(())
    }

    #[test]
    fn stripping_twice_is_rejected() -> Result<()> {
        let tokens = Tensor::zeros((2, 257), DType::U32, &Device::Cpu)?;
        let stripped = strip_control_token(&tokens, 256)?;
        let err = strip_control_token(&stripped, 256).unwrap_err();
        assert!(matches!(
            err,
            Error::TokenLength {
                expected: 257,
                found: 256
            }
        ));
        Ok(())
    }

    #[rstest]
    #[case(8, 4, 2)]
    #[case(1, 4, 1)]
    #[case(9, 4, 3)]
    #[case(5, 1, 5)]
    #[case(3, 8, 1)]
    fn rounds_round_up(#[case] n: usize, #[case] devices: usize, #[case] rounds: usize) {
        assert_eq!(rounds_for(n, devices), rounds);
    }

    #[test]
    fn truncation_keeps_the_first_samples_per_row() {
        let images = (0..12)
            .map(|i| DecodedImage::new(image::RgbImage::from_pixel(1, 1, image::Rgb([i, 0, 0]))))
            .collect();
        let samples = Samples {
            images,
            rounds: 2,
            seed: 0,
            rows: 2,
            requested: 5,
        };
        let kept = samples.clone().apply(ExcessPolicy::Keep);
        assert_eq!(kept.images.len(), 12);
        let truncated = samples.apply(ExcessPolicy::Truncate);
        assert_eq!(truncated.images.len(), 10);
        assert_eq!(truncated.images[9].as_rgb().get_pixel(0, 0).0[0], 9);
    }
}
