//! Boosted Haar cascade model in the OpenCV `opencv-cascade-classifier` XML format.
//!
//! Parses the stage/weak-classifier/feature tables of a `haarcascade_*.xml`
//! file and evaluates a single detection window against an integral image.

use crate::frame::IntegralImage;
use crate::types::Size;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// Subtracted from every stage threshold to absorb float round-off in the
/// stored values.
const STAGE_THRESHOLD_EPS: f64 = 1e-5;

/// Values per tree node in `internalNodes`: left, right, feature index, threshold.
const NODE_FIELDS: usize = 4;

/// Values per rectangle in a Haar feature: x, y, width, height, weight.
const RECT_FIELDS: usize = 5;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("missing element <{0}>")]
    MissingElement(String),
    #[error("malformed cascade: {0}")]
    Malformed(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

/// Outcome of evaluating one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVerdict {
    /// Passed every stage.
    Face,
    /// Rejected by the stage at this index.
    Rejected { stage: usize },
}

/// One weighted rectangle of a Haar feature, relative to the window origin.
#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

impl HaarFeature {
    fn raw_value(&self, ii: &IntegralImage, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight * ii.rect_sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// Internal node of a weak-classifier tree. Child indices `<= 0` name a leaf
/// (`-index` into the leaf table); positive indices name another node.
#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f64>,
}

impl WeakClassifier {
    fn predict(&self, mut feature_value: impl FnMut(usize) -> f64) -> f64 {
        let mut idx = 0usize;
        loop {
            let node = &self.nodes[idx];
            let next = if feature_value(node.feature) < node.threshold {
                node.left
            } else {
                node.right
            };
            if next <= 0 {
                return self.leaves[next.unsigned_abs() as usize];
            }
            idx = next as usize;
        }
    }
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

/// A loaded boosted Haar cascade.
#[derive(Debug, Clone)]
pub struct Cascade {
    window: Size,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl Cascade {
    /// Parse a cascade from the contents of an OpenCV cascade XML file.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = parse_document(xml)?;
        let storage = doc.require("opencv_storage")?;
        let root = storage
            .children
            .first()
            .ok_or_else(|| CascadeError::MissingElement("cascade".into()))?;

        if root.child("stageType").is_none() && root.child("stages").is_some() {
            return Err(CascadeError::Unsupported(
                "legacy (pre-traincascade) format; convert it with a current OpenCV".into(),
            ));
        }

        let stage_type = root.require("stageType")?.text.trim();
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = root.require("featureType")?.text.trim();
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let width: u32 = root.require("width")?.parse_scalar("width")?;
        let height: u32 = root.require("height")?.parse_scalar("height")?;
        if width < 3 || height < 3 {
            return Err(CascadeError::Malformed(format!(
                "window {width}x{height} is smaller than 3x3"
            )));
        }
        let window = Size::new(width, height);

        let features = root
            .require("features")?
            .items()
            .enumerate()
            .map(|(i, node)| parse_feature(i, node, window))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = root
            .require("stages")?
            .items()
            .enumerate()
            .map(|(i, node)| parse_stage(i, node, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(CascadeError::Malformed("cascade has no stages".into()));
        }

        Ok(Self {
            window,
            stages,
            features,
        })
    }

    /// Base detection window the cascade was trained on.
    pub fn window(&self) -> Size {
        self.window
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// Run the cascade on the window whose top-left corner is `(x, y)`.
    ///
    /// The window must lie inside the integral image.
    pub fn evaluate(&self, ii: &IntegralImage, x: u32, y: u32) -> WindowVerdict {
        let inv_norm = self.inverse_norm(ii, x, y);
        let mut value_of =
            |feature: usize| self.features[feature].raw_value(ii, x, y) * inv_norm;

        for (i, stage) in self.stages.iter().enumerate() {
            let sum: f64 = stage
                .classifiers
                .iter()
                .map(|c| c.predict(&mut value_of))
                .sum();
            if sum < stage.threshold {
                return WindowVerdict::Rejected { stage: i };
            }
        }
        WindowVerdict::Face
    }

    /// Reciprocal of the window's standard-deviation normalisation factor,
    /// measured over the window shrunk by one pixel on each side.
    fn inverse_norm(&self, ii: &IntegralImage, x: u32, y: u32) -> f64 {
        let (w, h) = (self.window.width - 2, self.window.height - 2);
        let area = (w * h) as f64;
        let sum = ii.rect_sum(x + 1, y + 1, w, h) as f64;
        let sq_sum = ii.rect_sq_sum(x + 1, y + 1, w, h) as f64;
        let nf = area * sq_sum - sum * sum;
        let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };
        1.0 / nf
    }
}

fn parse_feature(index: usize, node: &XmlNode, window: Size) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = node.child("tilted") {
        if tilted.text.trim() != "0" {
            return Err(CascadeError::Unsupported(format!(
                "feature {index} uses tilted rectangles"
            )));
        }
    }

    let rects = node
        .require("rects")?
        .items()
        .map(|r| {
            let v: Vec<f64> = r.parse_list("rect")?;
            if v.len() != RECT_FIELDS {
                return Err(CascadeError::Malformed(format!(
                    "feature {index}: rect needs {RECT_FIELDS} values, got {}",
                    v.len()
                )));
            }
            if v[..4].iter().any(|&c| c < 0.0 || c.fract() != 0.0) {
                return Err(CascadeError::Malformed(format!(
                    "feature {index}: rect coordinates must be non-negative integers"
                )));
            }
            let rect = WeightedRect {
                x: v[0] as u32,
                y: v[1] as u32,
                width: v[2] as u32,
                height: v[3] as u32,
                weight: v[4],
            };
            if rect.x + rect.width > window.width || rect.y + rect.height > window.height {
                return Err(CascadeError::Malformed(format!(
                    "feature {index}: rect exceeds the {}x{} window",
                    window.width, window.height
                )));
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() {
        return Err(CascadeError::Malformed(format!("feature {index} has no rects")));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(index: usize, node: &XmlNode, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold: f64 = node.require("stageThreshold")?.parse_scalar("stageThreshold")?;
    let classifiers = node
        .require("weakClassifiers")?
        .items()
        .map(|c| parse_weak_classifier(index, c, feature_count))
        .collect::<Result<Vec<_>, _>>()?;

    if classifiers.is_empty() {
        return Err(CascadeError::Malformed(format!("stage {index} has no weak classifiers")));
    }

    Ok(Stage {
        threshold: threshold - STAGE_THRESHOLD_EPS,
        classifiers,
    })
}

fn parse_weak_classifier(
    stage: usize,
    node: &XmlNode,
    feature_count: usize,
) -> Result<WeakClassifier, CascadeError> {
    let raw: Vec<f64> = node.require("internalNodes")?.parse_list("internalNodes")?;
    let leaves: Vec<f64> = node.require("leafValues")?.parse_list("leafValues")?;

    if raw.is_empty() || raw.len() % NODE_FIELDS != 0 {
        return Err(CascadeError::Malformed(format!(
            "stage {stage}: internalNodes length {} is not a multiple of {NODE_FIELDS} \
             (categorical features are not supported)",
            raw.len()
        )));
    }

    let node_count = raw.len() / NODE_FIELDS;
    let mut nodes = Vec::with_capacity(node_count);
    for (i, chunk) in raw.chunks_exact(NODE_FIELDS).enumerate() {
        let left = chunk[0] as i32;
        let right = chunk[1] as i32;
        let feature = chunk[2];
        if feature < 0.0 || feature as usize >= feature_count {
            return Err(CascadeError::Malformed(format!(
                "stage {stage}: feature index {feature} out of range (have {feature_count})"
            )));
        }
        for child in [left, right] {
            let valid = if child <= 0 {
                (child.unsigned_abs() as usize) < leaves.len()
            } else {
                // Children must point forward so evaluation always terminates.
                (child as usize) > i && (child as usize) < node_count
            };
            if !valid {
                return Err(CascadeError::Malformed(format!(
                    "stage {stage}: node {i} has invalid child {child}"
                )));
            }
        }
        nodes.push(Node {
            left,
            right,
            feature: feature as usize,
            threshold: chunk[3],
        });
    }

    Ok(WeakClassifier { nodes, leaves })
}

/// Minimal element tree; the cascade format only needs names, text and children.
#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn named(name: String) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn require(&self, name: &str) -> Result<&XmlNode, CascadeError> {
        self.child(name)
            .ok_or_else(|| CascadeError::MissingElement(name.to_string()))
    }

    /// Sequence entries, which OpenCV writes as `<_>` elements.
    fn items(&self) -> impl Iterator<Item = &XmlNode> {
        self.children.iter().filter(|c| c.name == "_")
    }

    fn parse_scalar<T: std::str::FromStr>(&self, what: &str) -> Result<T, CascadeError> {
        self.text
            .trim()
            .parse()
            .map_err(|_| CascadeError::Malformed(format!("bad {what} value {:?}", self.text)))
    }

    fn parse_list<T: std::str::FromStr>(&self, what: &str) -> Result<Vec<T>, CascadeError> {
        self.text
            .split_whitespace()
            .map(|tok| {
                tok.parse()
                    .map_err(|_| CascadeError::Malformed(format!("bad {what} value {tok:?}")))
            })
            .collect()
    }
}

fn parse_document(xml: &str) -> Result<XmlNode, CascadeError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack = vec![XmlNode::default()];
    loop {
        match reader.read_event()? {
            Event::Start(ref e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                stack.push(XmlNode::named(name));
            }
            Event::Empty(ref e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlNode::named(name));
                }
            }
            Event::End(_) => {
                let node = stack.pop().filter(|_| !stack.is_empty()).ok_or_else(|| {
                    CascadeError::Malformed("unbalanced closing tag".into())
                })?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Event::Text(e) => {
                let text = e.unescape()?;
                if let Some(current) = stack.last_mut() {
                    if !current.text.is_empty() {
                        current.text.push(' ');
                    }
                    current.text.push_str(&text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(CascadeError::Malformed("unexpected end of document".into()));
    }
    Ok(stack.remove(0))
}
