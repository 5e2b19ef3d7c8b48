//! Score-based re-ranking

use std::cmp::Ordering;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;

use crate::error::boxed;
use crate::{DecodedImage, Error, ModelHandle, Result, Scorer};

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredImage {
    pub image: DecodedImage,
    pub score: f32,
    /// Position in production order
    pub index: usize,
}

/// Scores are reported with two decimals.
pub fn format_score(score: f32) -> String {
    format!("{score:.2}")
}

/// Indices of `scores` from highest to lowest.
///
/// The sort is stable, so equal scores keep production order. NaN sorts last.
pub fn rank(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| match (scores[a].is_nan(), scores[b].is_nan()) {
        (false, false) => scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal),
        (a_nan, b_nan) => a_nan.cmp(&b_nan),
    });
    order
}

/// Pairs images with their scores and orders them by [`rank`].
pub fn ranked(images: Vec<DecodedImage>, scores: &[f32]) -> Result<Vec<ScoredImage>> {
    if images.len() != scores.len() {
        return Err(Error::Score(
            format!("{} scores for {} images", scores.len(), images.len()).into(),
        ));
    }
    let mut slots: Vec<Option<DecodedImage>> = images.into_iter().map(Some).collect();
    Ok(rank(scores)
        .into_iter()
        .filter_map(|index| {
            slots[index].take().map(|image| ScoredImage {
                image,
                score: scores[index],
                index,
            })
        })
        .collect())
}

/// Scores `images` against `prompt` in one device-parallel call.
///
/// Images are split into equal shards, one per replica; the last shard is
/// padded by repeating its final image and the padding scores dropped.
pub fn score_images(
    scorer: &ModelHandle<dyn Scorer>,
    pool: &ThreadPool,
    prompt: &str,
    images: &[DecodedImage],
) -> Result<Vec<f32>> {
    if images.is_empty() {
        return Ok(Vec::new());
    }
    let replicas = scorer.replica_count().max(1).min(images.len());
    let shard = images.len().div_ceil(replicas);
    let shards: Vec<Vec<DecodedImage>> = images
        .chunks(shard)
        .map(|chunk| {
            let mut padded = chunk.to_vec();
            if let Some(last) = chunk.last() {
                padded.resize(shard, last.clone());
            }
            padded
        })
        .collect();
    let lens: Vec<usize> = images.chunks(shard).map(<[DecodedImage]>::len).collect();

    let per_shard: Vec<Vec<f32>> = pool.install(|| {
        shards
            .par_iter()
            .enumerate()
            .map(|(replica, shard_images)| {
                let scores = scorer
                    .replica(replica)
                    .score(prompt, shard_images)
                    .map_err(|e| Error::Score(boxed(e)))?;
                if scores.len() != shard_images.len() {
                    return Err(Error::Score(
                        format!(
                            "scorer returned {} scores for {} images",
                            scores.len(),
                            shard_images.len()
                        )
                        .into(),
                    ));
                }
                Ok(scores)
            })
            .collect::<Result<_>>()
    })?;

    let scores: Vec<f32> = per_shard
        .into_iter()
        .zip(lens)
        .flat_map(|(scores, len)| scores.into_iter().take(len))
        .collect();
    debug!(images = scores.len(), shards = replicas, "scored images");
    Ok(scores)
}
