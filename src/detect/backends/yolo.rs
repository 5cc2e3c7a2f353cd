//! Darknet/YOLO output decoding.
//!
//! YOLO heads emit one row per candidate:
//! `[cx, cy, w, h, objectness, score_0, score_1, ...]`, with the box
//! normalized to `[0, 1]` relative to the network input. Because the input
//! is a plain resize of the frame (no letterboxing), scaling by the frame
//! size gives pixel coordinates directly.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::detect::result::Detection;

/// Newline-delimited class vocabulary (`coco.names` style). Line N names
/// class index N.
#[derive(Clone, Debug, Default)]
pub struct ClassLabels {
    names: Vec<String>,
}

impl ClassLabels {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read class names from {}", path.display()))?;
        let labels = Self::parse(&raw);
        if labels.is_empty() {
            return Err(anyhow!("class names file {} is empty", path.display()));
        }
        Ok(labels)
    }

    pub fn parse(raw: &str) -> Self {
        let mut names: Vec<String> = raw.lines().map(|line| line.trim().to_string()).collect();
        while names.last().is_some_and(|name| name.is_empty()) {
            names.pop();
        }
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name for a class index; unknown indices get a synthetic `classN` name.
    pub fn name(&self, index: usize) -> String {
        self.names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("class{index}"))
    }
}

/// Decode a flat buffer of `stride`-wide rows into pixel-space detections.
///
/// Each row is assigned its best-scoring class; rows whose best score is not
/// positive are skipped. Confidence filtering is left to `DetectionFilter`.
pub fn decode_rows(
    data: &[f32],
    stride: usize,
    frame_width: u32,
    frame_height: u32,
    labels: &ClassLabels,
) -> Result<Vec<Detection>> {
    if stride < 6 {
        return Err(anyhow!(
            "yolo rows need at least 6 values (box, objectness, one class), got {}",
            stride
        ));
    }
    if data.len() % stride != 0 {
        return Err(anyhow!(
            "yolo output length {} is not a multiple of row width {}",
            data.len(),
            stride
        ));
    }

    let fw = frame_width as f32;
    let fh = frame_height as f32;
    let mut detections = Vec::new();
    for row in data.chunks_exact(stride) {
        let Some((class_index, score)) = best_class(&row[5..]) else {
            continue;
        };
        if score <= 0.0 {
            continue;
        }
        let width = row[2] * fw;
        let height = row[3] * fh;
        let left = row[0] * fw - width / 2.0;
        let top = row[1] * fh - height / 2.0;
        if let Some(det) = Detection::clipped(left, top, width, height, frame_width, frame_height)
        {
            detections.push(
                det.with_confidence(score)
                    .with_label(labels.name(class_index)),
            );
        }
    }
    Ok(detections)
}

fn best_class(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, score)| score.is_finite())
        .fold(None, |best, (index, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((index, score)),
        })
}
