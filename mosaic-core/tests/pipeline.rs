use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use candle_core::{DType, Device, Tensor};
use mosaic_core::{
    DecodedImage, Decoder, Error, ExcessPolicy, Generator, ModelHandle, Pipeline, PromptEncoder,
    PromptTensors, SamplingParams, Scorer,
};
use rstest::rstest;

const CONTROL_TOKEN: u32 = 16384;
const PROMPT: &str = "sunset over a lake in the mountains";

/// Emits the control token followed by `tokens` copies of a seed-derived id.
struct SeedEcho {
    tokens: usize,
    seeds: Arc<Mutex<Vec<u64>>>,
}

impl Generator for SeedEcho {
    fn generate(
        &self,
        prompt: &PromptTensors,
        seed: u64,
        _params: &SamplingParams,
    ) -> anyhow::Result<Tensor> {
        self.seeds.lock().unwrap().push(seed);
        let rows = prompt.input_ids.dim(0)?;
        let id = (seed % 1000) as u32;
        let mut data = Vec::with_capacity(rows * (self.tokens + 1));
        for _ in 0..rows {
            data.push(CONTROL_TOKEN);
            data.extend(std::iter::repeat(id).take(self.tokens));
        }
        Ok(Tensor::from_vec(data, (rows, self.tokens + 1), &Device::Cpu)?)
    }
}

/// Paints every pixel with the first token id scaled into [0, 1].
struct Flat {
    size: usize,
    calls: Arc<AtomicUsize>,
    fail_on_call: Option<usize>,
}

impl Decoder for Flat {
    fn decode(&self, tokens: &Tensor) -> anyhow::Result<Tensor> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if Some(call) == self.fail_on_call {
            bail!("device out of memory");
        }
        let rows = tokens.dim(0)?;
        let first = tokens.narrow(1, 0, 1)?.to_dtype(DType::F32)?;
        let pixels = (first / 1000.0)?
            .broadcast_as((rows, self.size * self.size * 3))?
            .contiguous()?;
        Ok(pixels)
    }
}

/// Scores an image by its red channel, so brighter ranks higher.
struct Red;

impl Scorer for Red {
    fn score(&self, _prompt: &str, images: &[DecodedImage]) -> anyhow::Result<Vec<f32>> {
        Ok(images
            .iter()
            .map(|img| img.as_rgb().get_pixel(0, 0).0[0] as f32 / 2.55)
            .collect())
    }
}

struct Harness {
    pipeline: Pipeline,
    seeds: Arc<Mutex<Vec<u64>>>,
    decode_calls: Arc<AtomicUsize>,
}

fn encoder() -> PromptEncoder {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/tokenizer.json");
    PromptEncoder::from_file(path, 16).unwrap()
}

fn harness(devices: usize, tokens: usize, size: usize, fail_on_call: Option<usize>) -> Harness {
    let seeds = Arc::new(Mutex::new(Vec::new()));
    let decode_calls = Arc::new(AtomicUsize::new(0));
    let generators = (0..devices)
        .map(|_| {
            Box::new(SeedEcho {
                tokens,
                seeds: seeds.clone(),
            }) as Box<dyn Generator>
        })
        .collect();
    let decoders = (0..devices)
        .map(|_| {
            Box::new(Flat {
                size,
                calls: decode_calls.clone(),
                fail_on_call,
            }) as Box<dyn Decoder>
        })
        .collect();
    Harness {
        pipeline: assemble(generators, decoders, tokens, size),
        seeds,
        decode_calls,
    }
}

fn assemble(
    generators: Vec<Box<dyn Generator>>,
    decoders: Vec<Box<dyn Decoder>>,
    tokens: usize,
    size: usize,
) -> Pipeline {
    let devices = generators.len();
    let scorers = (0..devices)
        .map(|_| Box::new(Red) as Box<dyn Scorer>)
        .collect();
    Pipeline::new(
        ModelHandle::from_replicas("test/generator", "v1", DType::F32, generators),
        ModelHandle::from_replicas("test/decoder", "v1", DType::F32, decoders),
        Some(ModelHandle::from_replicas("openai/clip-test", "v1", DType::F32, scorers)),
        encoder(),
        vec![Device::Cpu; devices],
    )
    .unwrap()
    .with_image_shape(tokens, size)
}

/// Repeats the wrapped backend's batch twice along the row axis.
struct Doubled<T>(T);

impl<T: Generator> Generator for Doubled<T> {
    fn generate(
        &self,
        prompt: &PromptTensors,
        seed: u64,
        params: &SamplingParams,
    ) -> anyhow::Result<Tensor> {
        let tokens = self.0.generate(prompt, seed, params)?;
        Ok(Tensor::cat(&[&tokens, &tokens], 0)?)
    }
}

impl<T: Decoder> Decoder for Doubled<T> {
    fn decode(&self, tokens: &Tensor) -> anyhow::Result<Tensor> {
        let pixels = self.0.decode(tokens)?;
        Ok(Tensor::cat(&[&pixels, &pixels], 0)?)
    }
}

fn echo() -> SeedEcho {
    SeedEcho {
        tokens: 4,
        seeds: Arc::new(Mutex::new(Vec::new())),
    }
}

fn flat() -> Flat {
    Flat {
        size: 8,
        calls: Arc::new(AtomicUsize::new(0)),
        fail_on_call: None,
    }
}

fn batch_size_of(source: &(dyn std::error::Error + Send + Sync)) -> Option<(usize, usize)> {
    match source.downcast_ref::<Error>() {
        Some(Error::BatchSize { expected, found }) => Some((*expected, *found)),
        _ => None,
    }
}

#[test]
fn eight_predictions_on_four_devices() {
    let h = harness(4, 256, 256, None);
    let params = SamplingParams {
        n_predictions: 8,
        seed: Some(1234),
        ..SamplingParams::default()
    };
    let out = h.pipeline.run(PROMPT, &params).unwrap();

    assert_eq!(out.rounds, 2);
    assert_eq!(out.seed, 1234);
    assert_eq!(out.images.len(), 8);
    for image in &out.images {
        assert_eq!((image.width(), image.height()), (256, 256));
        assert_eq!(image.as_rgb().as_raw().len(), 256 * 256 * 3);
    }
    let scores = out.scores.unwrap();
    assert_eq!(scores.len(), 8);
    assert!(scores.windows(2).all(|w| w[0] >= w[1]), "{scores:?}");

    let mut indices = out.indices.clone();
    indices.sort_unstable();
    assert_eq!(indices, (0..8).collect::<Vec<_>>());
    assert_eq!(h.decode_calls.load(Ordering::SeqCst), 8);
}

#[rstest]
fn image_count_is_padded_to_full_rounds(
    #[values(1, 2, 3, 4, 5, 7, 8, 9)] n: usize,
    #[values(1, 2, 3, 4)] devices: usize,
) {
    let h = harness(devices, 4, 8, None);
    let params = SamplingParams {
        n_predictions: n,
        score: false,
        ..SamplingParams::default()
    };
    let out = h.pipeline.run(PROMPT, &params).unwrap();
    let rounds = n.div_ceil(devices);
    assert_eq!(out.rounds, rounds);
    assert_eq!(out.images.len(), rounds * devices);
    assert!(out.scores.is_none());
    assert_eq!(out.indices, (0..rounds * devices).collect::<Vec<_>>());
}

#[test]
fn single_prediction_keeps_or_truncates_padding() {
    let h = harness(4, 4, 8, None);
    let keep = SamplingParams {
        n_predictions: 1,
        ..SamplingParams::default()
    };
    let out = h.pipeline.run(PROMPT, &keep).unwrap();
    assert_eq!(out.rounds, 1);
    assert_eq!(out.images.len(), 4);

    let truncate = SamplingParams {
        excess: ExcessPolicy::Truncate,
        ..keep
    };
    let out = h.pipeline.run(PROMPT, &truncate).unwrap();
    assert_eq!(out.images.len(), 1);
    assert_eq!(out.scores.unwrap().len(), 1);
}

#[test]
fn device_seeds_are_unique_within_a_run() {
    let h = harness(4, 4, 8, None);
    let params = SamplingParams {
        n_predictions: 40,
        score: false,
        seed: Some(99),
        ..SamplingParams::default()
    };
    h.pipeline.run(PROMPT, &params).unwrap();
    let mut seeds = h.seeds.lock().unwrap().clone();
    assert_eq!(seeds.len(), 40);
    seeds.sort_unstable();
    seeds.dedup();
    assert_eq!(seeds.len(), 40);
}

#[test]
fn same_seed_reproduces_the_run() {
    let params = SamplingParams {
        n_predictions: 6,
        seed: Some(5),
        ..SamplingParams::default()
    };
    let a = harness(3, 4, 8, None).pipeline.run(PROMPT, &params).unwrap();
    let b = harness(3, 4, 8, None).pipeline.run(PROMPT, &params).unwrap();
    assert_eq!(a.images, b.images);
    assert_eq!(a.scores, b.scores);
}

#[test]
fn ranking_matches_scores() {
    let h = harness(2, 4, 8, None);
    let params = SamplingParams {
        n_predictions: 6,
        seed: Some(21),
        ..SamplingParams::default()
    };
    let out = h.pipeline.run(PROMPT, &params).unwrap();
    let scores = out.scores.unwrap();
    for (image, score) in out.images.iter().zip(&scores) {
        let expected = image.as_rgb().get_pixel(0, 0).0[0] as f32 / 2.55;
        assert_eq!(*score, expected);
    }
}

#[test]
fn decoder_failure_aborts_with_completed_rounds() {
    // Third decode call fails: round one (2 devices) completed, round two did not.
    let h = harness(2, 4, 8, Some(2));
    let params = SamplingParams {
        n_predictions: 6,
        ..SamplingParams::default()
    };
    let failure = h.pipeline.sample(PROMPT, &params).unwrap_err();
    assert_eq!(failure.rounds_completed, 1);
    assert_eq!(failure.rounds_planned, 3);
    assert_eq!(failure.partial.len(), 2);
    assert!(matches!(failure.source, Error::Decode { .. }));

    let h = harness(2, 4, 8, Some(0));
    let err = h.pipeline.run(PROMPT, &params).unwrap_err();
    assert!(matches!(err, Error::Decode { .. }), "{err}");
}

#[test]
fn mismatched_token_width_is_a_decode_error() {
    // The generator emits 4 image tokens but the pipeline expects 5.
    let h = harness(1, 4, 8, None);
    let pipeline = h.pipeline.with_image_shape(5, 8);
    let params = SamplingParams {
        n_predictions: 1,
        ..SamplingParams::default()
    };
    let err = pipeline.run(PROMPT, &params).unwrap_err();
    match err {
        Error::Decode { source, .. } => {
            let inner = source.downcast_ref::<Error>().unwrap();
            assert!(matches!(
                inner,
                Error::TokenLength {
                    expected: 6,
                    found: 5
                }
            ));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn invalid_params_fail_before_sampling() {
    let h = harness(2, 4, 8, None);
    let params = SamplingParams {
        top_p: Some(2.0),
        ..SamplingParams::default()
    };
    let err = h.pipeline.run(PROMPT, &params).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(h.seeds.lock().unwrap().is_empty());
    assert_eq!(h.decode_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn decoder_batch_must_match_prompt_rows() {
    let generators = (0..4).map(|_| Box::new(echo()) as Box<dyn Generator>).collect();
    let decoders = (0..4)
        .map(|_| Box::new(Doubled(flat())) as Box<dyn Decoder>)
        .collect();
    let pipeline = assemble(generators, decoders, 4, 8);
    let params = SamplingParams {
        n_predictions: 8,
        ..SamplingParams::default()
    };
    match pipeline.run(PROMPT, &params).unwrap_err() {
        Error::Decode { source, .. } => assert_eq!(batch_size_of(&*source), Some((1, 2))),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn generator_batch_must_match_prompt_rows() {
    let generators = (0..2)
        .map(|_| Box::new(Doubled(echo())) as Box<dyn Generator>)
        .collect();
    let decoders = (0..2).map(|_| Box::new(flat()) as Box<dyn Decoder>).collect();
    let pipeline = assemble(generators, decoders, 4, 8);
    let params = SamplingParams {
        n_predictions: 2,
        ..SamplingParams::default()
    };
    let failure = pipeline.sample(PROMPT, &params).unwrap_err();
    assert_eq!(failure.rounds_completed, 0);
    assert!(failure.partial.is_empty());
    match failure.source {
        Error::Generation { source, .. } => assert_eq!(batch_size_of(&*source), Some((1, 2))),
        other => panic!("unexpected error {other}"),
    }
}
