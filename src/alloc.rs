//! Probability-map helpers.
//!
//! Policies report their action distribution as a `BTreeMap<arm id, probability>`
//! so iteration order (and therefore sampling) is stable.

use std::collections::BTreeMap;

/// Arg-max over `(id, score)` pairs with a lexicographic tie-break.
///
/// Non-finite scores lose to any finite score.
pub fn argmax_stable<'a, I>(scores: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut best: Option<(&'a str, f64)> = None;
    for (id, s) in scores {
        let s = if s.is_finite() { s } else { f64::NEG_INFINITY };
        best = match best {
            None => Some((id, s)),
            Some((bid, bs)) => {
                if s > bs + 1e-12 || ((s - bs).abs() <= 1e-12 && id < bid) {
                    Some((id, s))
                } else {
                    Some((bid, bs))
                }
            }
        };
    }
    best.map(|(id, _)| id)
}

/// Inverse-CDF draw from a distribution given `u` in `[0, 1)`.
///
/// Falls back to the last key on numerical shortfall.
pub fn sample_from<'a>(probs: &'a BTreeMap<String, f64>, u: f64) -> Option<&'a str> {
    let mut cdf = 0.0;
    for (k, &p) in probs {
        cdf += p;
        if u < cdf {
            return Some(k.as_str());
        }
    }
    probs.keys().next_back().map(String::as_str)
}
