use candle_core::Result;

/// One decoding step of an autoregressive model for a single utterance.
pub trait StepDecoder {
    type State: Clone;

    fn initial_state(&self) -> Result<Self::State>;

    /// Consumes `token` and returns the log probabilities of the next token.
    fn step(&self, state: &Self::State, token: u32) -> Result<(Vec<f32>, Self::State)>;
}

#[derive(Debug, Clone)]
pub struct Hypothesis<S> {
    /// Emitted tokens, without sos and eos.
    pub tokens: Vec<u32>,
    pub score: f32,
    pub finished: bool,
    state: S,
}

#[derive(Debug, Clone, Copy)]
pub struct BeamSearch {
    pub beam_width: usize,
    pub max_len: usize,
    pub sos: u32,
    pub eos: u32,
}

impl BeamSearch {
    pub fn new(beam_width: usize, max_len: usize, sos: u32, eos: u32) -> Self {
        Self {
            beam_width: beam_width.max(1),
            max_len,
            sos,
            eos,
        }
    }

    /// Returns hypotheses sorted by score, best first.
    pub fn search<D: StepDecoder>(&self, decoder: &D) -> Result<Vec<Hypothesis<D::State>>> {
        let mut beams = vec![Hypothesis {
            tokens: vec![],
            score: 0.,
            finished: false,
            state: decoder.initial_state()?,
        }];
        let mut finished = Vec::new();

        for _ in 0..self.max_len {
            let mut candidates = Vec::with_capacity(beams.len() * self.beam_width);
            for hyp in &beams {
                let last = hyp.tokens.last().copied().unwrap_or(self.sos);
                let (log_probs, state) = decoder.step(&hyp.state, last)?;
                for (token, log_prob) in top_k(&log_probs, self.beam_width) {
                    let mut tokens = hyp.tokens.clone();
                    let is_eos = token == self.eos;
                    if !is_eos {
                        tokens.push(token);
                    }
                    candidates.push(Hypothesis {
                        tokens,
                        score: hyp.score + log_prob,
                        finished: is_eos,
                        state: state.clone(),
                    });
                }
            }

            candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
            candidates.truncate(self.beam_width);

            beams = Vec::with_capacity(self.beam_width);
            for hyp in candidates {
                if hyp.finished {
                    finished.push(hyp);
                } else {
                    beams.push(hyp);
                }
            }

            if beams.is_empty() || finished.len() >= self.beam_width {
                break;
            }
        }

        // hypotheses cut by max_len compete with the finished ones
        finished.extend(beams);
        finished.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(finished)
    }

    pub fn best<D: StepDecoder>(&self, decoder: &D) -> Result<Vec<u32>> {
        Ok(self
            .search(decoder)?
            .into_iter()
            .next()
            .map(|hyp| hyp.tokens)
            .unwrap_or_default())
    }
}

/// Indices and values of the `k` largest entries, largest first.
fn top_k(values: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed = values
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as u32, v))
        .collect::<Vec<_>>();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed
}
