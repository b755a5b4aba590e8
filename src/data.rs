use candle_core::{Device, Result, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::config::LabelType;

/// Character inventory; `_` stands for the word boundary.
pub const CHARS: &str = "_abcdefghijklmnopqrstuvwxyz";

pub const WORDS: [&str; 11] = [
    "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "a", "cat", "sleeps",
];

const TRANSCRIPTS: [&str; 4] = [
    "the quick brown fox",
    "jumps over the lazy dog",
    "a lazy cat sleeps",
    "the fox sleeps",
];

/// Width of a single acoustic frame.
pub const FEATURE_DIM: usize = 40;
const FRAMES_PER_CHAR: usize = 3;
const FEATURE_NOISE: f64 = 0.1;

pub fn num_classes(label_type: LabelType) -> usize {
    match label_type {
        LabelType::Char => CHARS.len(),
        LabelType::Word => WORDS.len(),
    }
}

pub fn char2idx(text: &str) -> Vec<u32> {
    text.chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter_map(|c| CHARS.find(c).map(|i| i as u32))
        .collect()
}

/// Maps ids back to characters. `num_classes` and `num_classes + 1` are
/// rendered as `<` (sos) and `>` (eos).
pub fn idx2char(ids: &[u32]) -> String {
    let sos = CHARS.len() as u32;
    ids.iter()
        .filter_map(|&id| match id {
            id if id < sos => CHARS.chars().nth(id as usize),
            id if id == sos => Some('<'),
            id if id == sos + 1 => Some('>'),
            _ => None,
        })
        .collect()
}

pub fn word2idx(text: &str) -> Vec<u32> {
    text.split_whitespace()
        .filter_map(|w| WORDS.iter().position(|v| *v == w).map(|i| i as u32))
        .collect()
}

/// Words joined by `_`, with `<` / `>` for sos / eos.
pub fn idx2word(ids: &[u32]) -> String {
    let sos = WORDS.len() as u32;
    ids.iter()
        .filter_map(|&id| match id {
            id if id < sos => Some(WORDS[id as usize]),
            id if id == sos => Some("<"),
            id if id == sos + 1 => Some(">"),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("_")
}

pub fn labels_to_text(label_type: LabelType, ids: &[u32]) -> String {
    match label_type {
        LabelType::Char => idx2char(ids),
        LabelType::Word => idx2word(ids),
    }
}

#[derive(Debug, Clone)]
pub struct Utterance {
    /// (frames, feature_dim)
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<u32>,
    pub transcript: String,
}

/// A padded mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// (batch, max_frames, feature_dim)
    pub xs: Tensor,
    pub x_lens: Vec<usize>,
    /// Label ids without sos / eos.
    pub ys: Vec<Vec<u32>>,
    pub transcripts: Vec<String>,
}

/// Concatenates each frame with its `splice - 1` neighbours (edges repeat).
fn splice_frames(frames: &[Vec<f32>], splice: usize) -> Vec<Vec<f32>> {
    if splice <= 1 {
        return frames.to_vec();
    }
    let left = (splice - 1) / 2;
    let last = frames.len().saturating_sub(1);
    (0..frames.len())
        .map(|t| {
            (0..splice)
                .flat_map(|k| {
                    let idx = (t + k).saturating_sub(left).min(last);
                    frames[idx].iter().copied()
                })
                .collect()
        })
        .collect()
}

/// Stacks `num_stack` consecutive frames, zero padding the tail.
fn stack_frames(frames: &[Vec<f32>], num_stack: usize) -> Vec<Vec<f32>> {
    if num_stack <= 1 {
        return frames.to_vec();
    }
    let dim = frames.first().map(Vec::len).unwrap_or(0);
    frames
        .chunks(num_stack)
        .map(|chunk| {
            let mut stacked = chunk.concat();
            stacked.resize(dim * num_stack, 0.);
            stacked
        })
        .collect()
}

/// Synthetic utterances: every character has a prototype frame, an utterance
/// repeats the prototypes of its transcript with Gaussian noise.
pub struct ToyDataset {
    pub label_type: LabelType,
    pub items: Vec<Utterance>,
    pub feature_dim: usize,
}

impl ToyDataset {
    pub fn new(
        label_type: LabelType,
        num_utterances: usize,
        num_stack: usize,
        splice: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0f32, 1.).map_err(candle_core::Error::wrap)?;
        let noise = Normal::new(0f32, FEATURE_NOISE as f32).map_err(candle_core::Error::wrap)?;

        let prototypes = (0..CHARS.len())
            .map(|_| (0..FEATURE_DIM).map(|_| normal.sample(&mut rng)).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        let items = (0..num_utterances)
            .map(|i| {
                let transcript = TRANSCRIPTS[i % TRANSCRIPTS.len()];
                let frames = char2idx(transcript)
                    .into_iter()
                    .flat_map(|c| std::iter::repeat(c).take(FRAMES_PER_CHAR))
                    .map(|c| {
                        prototypes[c as usize]
                            .iter()
                            .map(|v| v + noise.sample(&mut rng))
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>();
                let features = stack_frames(&splice_frames(&frames, splice), num_stack);
                let labels = match label_type {
                    LabelType::Char => char2idx(transcript),
                    LabelType::Word => word2idx(transcript),
                };
                Utterance {
                    features,
                    labels,
                    transcript: transcript.to_string(),
                }
            })
            .collect();

        Ok(Self {
            label_type,
            items,
            feature_dim: FEATURE_DIM * splice.max(1) * num_stack.max(1),
        })
    }

    pub fn batcher<'a>(
        &'a self,
        batch_size: usize,
        shuffle: Option<&mut StdRng>,
        device: &'a Device,
    ) -> ToyBatcher<'a> {
        let mut order = self.items.iter().collect::<Vec<_>>();
        if let Some(rng) = shuffle {
            order.shuffle(rng);
        }
        ToyBatcher {
            dataset: order,
            batch_size: batch_size.max(1),
            current_idx: 0,
            feature_dim: self.feature_dim,
            device,
        }
    }
}

pub struct ToyBatcher<'a> {
    dataset: Vec<&'a Utterance>,
    batch_size: usize,
    current_idx: usize,
    feature_dim: usize,
    device: &'a Device,
}

impl ToyBatcher<'_> {
    fn collate(&self, items: &[&Utterance]) -> Result<Batch> {
        let x_lens = items.iter().map(|u| u.features.len()).collect::<Vec<_>>();
        let max_len = x_lens.iter().copied().max().unwrap_or(0);

        let mut data = Vec::with_capacity(items.len() * max_len * self.feature_dim);
        for item in items {
            for frame in &item.features {
                data.extend_from_slice(frame);
            }
            data.resize(data.len() + (max_len - item.features.len()) * self.feature_dim, 0.);
        }
        let xs = Tensor::from_vec(data, (items.len(), max_len, self.feature_dim), self.device)?;

        Ok(Batch {
            xs,
            x_lens,
            ys: items.iter().map(|u| u.labels.clone()).collect(),
            transcripts: items.iter().map(|u| u.transcript.clone()).collect(),
        })
    }
}

impl Iterator for ToyBatcher<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.dataset.len() {
            return None;
        }

        // the last batch may be smaller than `batch_size`
        let end_idx = (self.current_idx + self.batch_size).min(self.dataset.len());
        let batch = self.collate(&self.dataset[self.current_idx..end_idx]);
        self.current_idx = end_idx;
        Some(batch)
    }
}

/// One fixed batch of toy utterances, the training target of the smoke tests.
pub fn generate_data(
    label_type: LabelType,
    batch_size: usize,
    num_stack: usize,
    splice: usize,
    seed: u64,
    device: &Device,
) -> Result<Batch> {
    let dataset = ToyDataset::new(label_type, batch_size, num_stack, splice, seed)?;
    match dataset.batcher(batch_size, None, device).next() {
        Some(batch) => batch,
        None => candle_core::bail!("empty toy batch"),
    }
}

/// Draws `true` with probability `p`.
pub fn coin(rng: &mut impl Rng, p: f64) -> bool {
    p > 0. && rng.gen_bool(p.min(1.))
}
