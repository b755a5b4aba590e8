/// Levenshtein distance between two token sequences.
pub fn edit_distance<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> usize {
    let mut prev = (0..=hypothesis.len()).collect::<Vec<_>>();
    let mut curr = vec![0; hypothesis.len() + 1];

    for (i, r) in reference.iter().enumerate() {
        curr[0] = i + 1;
        for (j, h) in hypothesis.iter().enumerate() {
            let substitution = prev[j] + usize::from(r != h);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[hypothesis.len()]
}

fn rate(errors: usize, ref_len: usize, normalize: bool) -> f64 {
    if !normalize {
        return errors as f64;
    }
    if ref_len == 0 {
        return if errors == 0 { 0. } else { 1. };
    }
    errors as f64 / ref_len as f64
}

/// Character error rate. Spaces are ignored.
pub fn compute_cer(reference: &str, hypothesis: &str, normalize: bool) -> f64 {
    let reference = reference.chars().filter(|c| !c.is_whitespace()).collect::<Vec<_>>();
    let hypothesis = hypothesis.chars().filter(|c| !c.is_whitespace()).collect::<Vec<_>>();
    rate(edit_distance(&reference, &hypothesis), reference.len(), normalize)
}

/// Word error rate over already split words.
pub fn compute_wer<S: AsRef<str>>(reference: &[S], hypothesis: &[S], normalize: bool) -> f64 {
    let reference = reference
        .iter()
        .map(AsRef::as_ref)
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    let hypothesis = hypothesis
        .iter()
        .map(AsRef::as_ref)
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    rate(edit_distance(&reference, &hypothesis), reference.len(), normalize)
}
