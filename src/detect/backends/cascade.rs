//! Haar cascade face detection.
//!
//! Viola-Jones evaluation of a boosted cascade of Haar-like features, loaded
//! from OpenCV cascade XML. Both the legacy `opencv-haar-classifier` layout
//! (e.g. `haarcascade_frontalface_alt.xml`) and the newer
//! `opencv-cascade-classifier` layout are accepted. Tilted features are not
//! supported and are rejected at load time.

use anyhow::{anyhow, Context, Result};
use image::GrayImage;
use roxmltree::Node;
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Rectangle grouping tolerance, as a fraction of the smaller box side.
const GROUP_EPS: f32 = 0.2;

/// Subtracted from every stage threshold on load, as OpenCV does for both
/// cascade layouts.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;

#[derive(Clone, Debug)]
pub struct CascadeParams {
    /// Window growth per pyramid level. Must be > 1.
    pub scale_factor: f32,
    /// Minimum neighbours for a group of raw hits to count as one face.
    /// Zero disables grouping.
    pub min_neighbors: u32,
    /// Smallest window edge in pixels. Zero starts at the cascade's own
    /// window size.
    pub min_size: u32,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 3,
            min_size: 0,
        }
    }
}

pub struct HaarCascade {
    window: (u32, u32),
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

struct Stage {
    threshold: f32,
    trees: Vec<Tree>,
}

struct Tree {
    nodes: Vec<TreeNode>,
}

struct TreeNode {
    feature: usize,
    threshold: f32,
    left: Branch,
    right: Branch,
}

#[derive(Clone, Copy)]
enum Branch {
    Leaf(f32),
    Node(usize),
}

struct HaarFeature {
    rects: Vec<WeightedRect>,
}

#[derive(Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    weight: f32,
}

/// Feature rectangle resolved for one pyramid scale.
struct ScaledRect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    weight: f32,
}

/// Window geometry for one pyramid scale. Feature sums and the variance are
/// normalized over the window shrunk by one scaled pixel on each side, which
/// is the region OpenCV cascades are trained against.
struct ScaledWindow {
    width: u32,
    height: u32,
    norm: (u32, u32, u32, u32),
    inv_norm_area: f64,
}

impl ScaledWindow {
    fn new(window: (u32, u32), scale: f32) -> Self {
        let width = (window.0 as f32 * scale).round() as u32;
        let height = (window.1 as f32 * scale).round() as u32;
        let inset = |len: u32, span: u32| -> (u32, u32) {
            if len <= 2 {
                return (0, span);
            }
            let offset = (scale.round() as u32).min(span - 1);
            let inner = (((len - 2) as f32 * scale).round() as u32).clamp(1, span - offset);
            (offset, inner)
        };
        let (nx, nw) = inset(window.0, width);
        let (ny, nh) = inset(window.1, height);
        Self {
            width,
            height,
            norm: (nx, ny, nw, nh),
            inv_norm_area: 1.0 / (nw as f64 * nh as f64),
        }
    }
}

/// Integral and squared-integral images with a zero top row and left column.
struct Integrals {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl Integrals {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        let raw = image.as_raw();
        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }
        Self {
            stride,
            sum,
            sq_sum,
        }
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y1 * stride + x0]
            - table[y0 * stride + x1]
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sq_sum, self.stride, x, y, w, h)
    }
}

impl HaarCascade {
    pub fn from_path(path: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(path)
            .with_context(|| format!("read cascade file {}", path.display()))?;
        Self::parse(&xml).with_context(|| format!("load cascade {}", path.display()))
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml).context("parse cascade xml")?;
        let cascade = elements(doc.root_element())
            .next()
            .ok_or_else(|| anyhow!("cascade xml has no classifier element"))?;
        let cascade = match cascade.attribute("type_id") {
            Some("opencv-haar-classifier") => parse_legacy(cascade)?,
            Some("opencv-cascade-classifier") => parse_modern(cascade)?,
            _ if opt_child(cascade, "stageType").is_some() => parse_modern(cascade)?,
            _ if opt_child(cascade, "size").is_some() => parse_legacy(cascade)?,
            _ => return Err(anyhow!("unrecognized cascade layout")),
        };
        if cascade.stages.is_empty() {
            return Err(anyhow!("cascade has no stages"));
        }
        if cascade.window.0 == 0 || cascade.window.1 == 0 {
            return Err(anyhow!("cascade window size must be non-zero"));
        }
        Ok(cascade)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn window(&self) -> (u32, u32) {
        self.window
    }

    /// Multi-scale sliding-window detection followed by rectangle grouping.
    pub fn detect(&self, image: &GrayImage, params: &CascadeParams) -> Vec<Detection> {
        let (img_w, img_h) = image.dimensions();
        let (win_w, win_h) = self.window;
        let integrals = Integrals::new(image);

        let mut scale = (params.min_size as f32 / win_w.min(win_h) as f32).max(1.0);
        let mut hits = Vec::new();
        loop {
            let window = ScaledWindow::new((win_w, win_h), scale);
            let (ww, wh) = (window.width, window.height);
            if ww > img_w || wh > img_h {
                break;
            }
            let scaled = self.scale_features(scale, ww, wh);
            let step = (scale * if scale > 2.0 { 1.0 } else { 2.0 }).round().max(1.0) as usize;

            for y in (0..=img_h - wh).step_by(step) {
                for x in (0..=img_w - ww).step_by(step) {
                    if self.window_passes(&integrals, &scaled, &window, x, y) {
                        hits.push(Detection::new(x, y, ww, wh));
                    }
                }
            }
            scale *= params.scale_factor;
        }

        group_rectangles(hits, params.min_neighbors)
    }

    /// Scale every feature to a `ww` x `wh` window, keeping rects inside it.
    fn scale_features(&self, scale: f32, ww: u32, wh: u32) -> Vec<Vec<ScaledRect>> {
        let fit = |offset: u32, len: u32, span: u32| -> (u32, u32) {
            let offset = ((offset as f32 * scale).round() as u32).min(span - 1);
            let len = ((len as f32 * scale).round() as u32).clamp(1, span - offset);
            (offset, len)
        };
        self.features
            .iter()
            .map(|feature| {
                let mut rects: Vec<ScaledRect> = feature
                    .rects
                    .iter()
                    .map(|r| {
                        let (x, w) = fit(r.x, r.w, ww);
                        let (y, h) = fit(r.y, r.h, wh);
                        ScaledRect {
                            x,
                            y,
                            w,
                            h,
                            weight: r.weight,
                        }
                    })
                    .collect();
                // Rounding breaks the zero-sum balance between rectangles;
                // re-derive the first weight from the others.
                if rects.len() > 1 {
                    let area0 = (rects[0].w * rects[0].h) as f32;
                    let rest: f32 = rects[1..]
                        .iter()
                        .map(|r| r.weight * (r.w * r.h) as f32)
                        .sum();
                    rects[0].weight = -rest / area0;
                }
                rects
            })
            .collect()
    }

    fn window_passes(
        &self,
        integrals: &Integrals,
        scaled: &[Vec<ScaledRect>],
        window: &ScaledWindow,
        x: u32,
        y: u32,
    ) -> bool {
        let inv_area = window.inv_norm_area;
        let (nx, ny, nw, nh) = window.norm;
        let mean = integrals.sum(x + nx, y + ny, nw, nh) as f64 * inv_area;
        let variance = integrals.sq_sum(x + nx, y + ny, nw, nh) as f64 * inv_area - mean * mean;
        let norm = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut stage_sum = 0.0f32;
            for tree in &stage.trees {
                let mut index = 0usize;
                loop {
                    let node = &tree.nodes[index];
                    let value: f64 = scaled[node.feature]
                        .iter()
                        .map(|r| {
                            integrals.sum(x + r.x, y + r.y, r.w, r.h) as f64 * r.weight as f64
                        })
                        .sum::<f64>()
                        * inv_area;
                    let branch = if value < node.threshold as f64 * norm {
                        node.left
                    } else {
                        node.right
                    };
                    match branch {
                        Branch::Leaf(v) => {
                            stage_sum += v;
                            break;
                        }
                        Branch::Node(next) => index = next,
                    }
                }
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }

    fn validate(&self) -> Result<()> {
        let (win_w, win_h) = self.window;
        for feature in &self.features {
            for r in &feature.rects {
                if r.x + r.w > win_w || r.y + r.h > win_h {
                    return Err(anyhow!(
                        "feature rect {} {} {} {} exceeds {}x{} window",
                        r.x,
                        r.y,
                        r.w,
                        r.h,
                        win_w,
                        win_h
                    ));
                }
            }
        }
        for stage in &self.stages {
            for tree in &stage.trees {
                if tree.nodes.is_empty() {
                    return Err(anyhow!("cascade tree has no nodes"));
                }
                for node in &tree.nodes {
                    if node.feature >= self.features.len() {
                        return Err(anyhow!("node references missing feature {}", node.feature));
                    }
                    for branch in [node.left, node.right] {
                        if let Branch::Node(next) = branch {
                            if next >= tree.nodes.len() {
                                return Err(anyhow!("node references missing child {}", next));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// XML loading
// ----------------------------------------------------------------------------

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn opt_child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    elements(node).find(|n| n.has_tag_name(name))
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>> {
    opt_child(node, name).ok_or_else(|| {
        anyhow!(
            "<{}> missing child <{}>",
            node.tag_name().name(),
            name
        )
    })
}

fn numbers(node: Node<'_, '_>) -> Result<Vec<f32>> {
    node.text()
        .unwrap_or("")
        .split_whitespace()
        .map(|token| {
            token
                .parse::<f32>()
                .with_context(|| {
                    format!("invalid number '{}' in <{}>", token, node.tag_name().name())
                })
        })
        .collect()
}

fn number(node: Node<'_, '_>, name: &str) -> Result<f32> {
    numbers(child(node, name)?)?
        .first()
        .copied()
        .ok_or_else(|| anyhow!("<{}> is empty", name))
}

fn parse_rects(feature: Node<'_, '_>) -> Result<HaarFeature> {
    if let Some(tilted) = opt_child(feature, "tilted") {
        if numbers(tilted)?.first().copied().unwrap_or(0.0) != 0.0 {
            return Err(anyhow!("tilted haar features are not supported"));
        }
    }
    let mut rects = Vec::new();
    for rect in elements(child(feature, "rects")?) {
        let values = numbers(rect)?;
        let [x, y, w, h, weight] = values[..] else {
            return Err(anyhow!("feature rect needs 5 values, got {}", values.len()));
        };
        if x < 0.0 || y < 0.0 || w <= 0.0 || h <= 0.0 {
            return Err(anyhow!("feature rect {x} {y} {w} {h} is invalid"));
        }
        rects.push(WeightedRect {
            x: x as u32,
            y: y as u32,
            w: w as u32,
            h: h as u32,
            weight,
        });
    }
    if rects.is_empty() {
        return Err(anyhow!("feature has no rects"));
    }
    Ok(HaarFeature { rects })
}

fn legacy_branch(node: Node<'_, '_>, val: &str, next: &str) -> Result<Branch> {
    if let Some(leaf) = opt_child(node, val) {
        let value = numbers(leaf)?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("<{}> is empty", val))?;
        return Ok(Branch::Leaf(value));
    }
    let index = number(node, next)?;
    Ok(Branch::Node(index as usize))
}

fn parse_legacy(cascade: Node<'_, '_>) -> Result<HaarCascade> {
    let size = numbers(child(cascade, "size")?)?;
    let [w, h] = size[..] else {
        return Err(anyhow!("<size> needs 2 values"));
    };

    let mut features = Vec::new();
    let mut stages = Vec::new();
    for stage in elements(child(cascade, "stages")?) {
        let mut trees = Vec::new();
        for tree in elements(child(stage, "trees")?) {
            let mut nodes = Vec::new();
            for node in elements(tree) {
                features.push(parse_rects(child(node, "feature")?)?);
                nodes.push(TreeNode {
                    feature: features.len() - 1,
                    threshold: number(node, "threshold")?,
                    left: legacy_branch(node, "left_val", "left_node")?,
                    right: legacy_branch(node, "right_val", "right_node")?,
                });
            }
            trees.push(Tree { nodes });
        }
        stages.push(Stage {
            threshold: number(stage, "stage_threshold")? - STAGE_THRESHOLD_EPS,
            trees,
        });
    }

    let cascade = HaarCascade {
        window: (w as u32, h as u32),
        stages,
        features,
    };
    cascade.validate()?;
    Ok(cascade)
}

fn parse_modern(cascade: Node<'_, '_>) -> Result<HaarCascade> {
    let stage_type = child(cascade, "stageType")?.text().unwrap_or("").trim();
    let feature_type = child(cascade, "featureType")?.text().unwrap_or("").trim();
    if stage_type != "BOOST" || feature_type != "HAAR" {
        return Err(anyhow!(
            "unsupported cascade {}/{}; only BOOST/HAAR is supported",
            stage_type,
            feature_type
        ));
    }
    let w = number(cascade, "width")? as u32;
    let h = number(cascade, "height")? as u32;

    let features = elements(child(cascade, "features")?)
        .map(parse_rects)
        .collect::<Result<Vec<_>>>()?;

    let mut stages = Vec::new();
    for stage in elements(child(cascade, "stages")?) {
        let mut trees = Vec::new();
        for weak in elements(child(stage, "weakClassifiers")?) {
            let internal = numbers(child(weak, "internalNodes")?)?;
            let leaves = numbers(child(weak, "leafValues")?)?;
            if internal.is_empty() || internal.len() % 4 != 0 {
                return Err(anyhow!("internalNodes must hold groups of 4 values"));
            }
            let branch = |value: f32| -> Result<Branch> {
                let index = value as i64;
                if index > 0 {
                    Ok(Branch::Node(index as usize))
                } else {
                    leaves
                        .get((-index) as usize)
                        .copied()
                        .map(Branch::Leaf)
                        .ok_or_else(|| anyhow!("leaf index {} out of range", -index))
                }
            };
            let nodes = internal
                .chunks_exact(4)
                .map(|n| {
                    Ok(TreeNode {
                        left: branch(n[0])?,
                        right: branch(n[1])?,
                        feature: n[2] as usize,
                        threshold: n[3],
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            trees.push(Tree { nodes });
        }
        stages.push(Stage {
            threshold: number(stage, "stageThreshold")? - STAGE_THRESHOLD_EPS,
            trees,
        });
    }

    let cascade = HaarCascade {
        window: (w, h),
        stages,
        features,
    };
    cascade.validate()?;
    Ok(cascade)
}

// ----------------------------------------------------------------------------
// Grouping
// ----------------------------------------------------------------------------

fn similar(a: &Detection, b: &Detection) -> bool {
    let delta = GROUP_EPS
        * (a.width.min(b.width) as f32 + a.height.min(b.height) as f32)
        * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster raw window hits and average each cluster. Clusters with no more
/// than `min_neighbors` members are discarded, as are small clusters sitting
/// inside a stronger one.
pub(crate) fn group_rectangles(hits: Vec<Detection>, min_neighbors: u32) -> Vec<Detection> {
    if min_neighbors == 0 || hits.is_empty() {
        return hits;
    }

    let mut parent: Vec<usize> = (0..hits.len()).collect();
    for i in 0..hits.len() {
        for j in (i + 1)..hits.len() {
            if similar(&hits[i], &hits[j]) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    let mut clusters: Vec<(usize, [u64; 4], u32)> = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        let root = find(&mut parent, i);
        let slot = match clusters.iter().position(|(r, _, _)| *r == root) {
            Some(slot) => slot,
            None => {
                clusters.push((root, [0; 4], 0));
                clusters.len() - 1
            }
        };
        let entry = &mut clusters[slot];
        entry.1[0] += hit.x as u64;
        entry.1[1] += hit.y as u64;
        entry.1[2] += hit.width as u64;
        entry.1[3] += hit.height as u64;
        entry.2 += 1;
    }

    let averaged: Vec<(Detection, u32)> = clusters
        .into_iter()
        .filter(|(_, _, n)| *n > min_neighbors)
        .map(|(_, sums, n)| {
            let avg = |s: u64| (s as f64 / n as f64).round() as u32;
            (
                Detection::new(avg(sums[0]), avg(sums[1]), avg(sums[2]), avg(sums[3])),
                n,
            )
        })
        .collect();

    averaged
        .iter()
        .enumerate()
        .filter(|(i, (r1, n1))| {
            !averaged.iter().enumerate().any(|(j, (r2, n2))| {
                if *i == j {
                    return false;
                }
                let dx = (r2.width as f32 * GROUP_EPS).round() as i64;
                let dy = (r2.height as f32 * GROUP_EPS).round() as i64;
                let inside = r1.x as i64 >= r2.x as i64 - dx
                    && r1.y as i64 >= r2.y as i64 - dy
                    && (r1.x + r1.width) as i64 <= (r2.x + r2.width) as i64 + dx
                    && (r1.y + r1.height) as i64 <= (r2.y + r2.height) as i64 + dy;
                inside && (*n2 > (*n1).max(3) || *n1 < 3)
            })
        })
        .map(|(_, (det, _))| det.clone().with_label("face"))
        .collect()
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

/// Face detector backed by a Haar cascade. Reports every grouped face; no
/// confidence is attached.
pub struct CascadeBackend {
    cascade: HaarCascade,
    params: CascadeParams,
}

impl CascadeBackend {
    pub fn from_path(path: &Path, params: CascadeParams) -> Result<Self> {
        if params.scale_factor <= 1.0 {
            return Err(anyhow!("cascade scale_factor must be > 1.0"));
        }
        let cascade = HaarCascade::from_path(path)?;
        log::info!(
            "loaded cascade {} ({} stages, {}x{} window)",
            path.display(),
            cascade.stage_count(),
            cascade.window.0,
            cascade.window.1
        );
        Ok(Self { cascade, params })
    }
}

impl DetectorBackend for CascadeBackend {
    fn name(&self) -> &'static str {
        "cascade"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let gray = image::imageops::grayscale(frame.image());
        Ok(self
            .cascade
            .detect(&gray, &self.params)
            .into_iter()
            .map(|det| det.with_label("face"))
            .collect())
    }
}
