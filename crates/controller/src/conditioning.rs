//! Rolling median filter applied to raw sensor values.

use std::collections::VecDeque;

/// Number of samples kept per quantity.
pub const WINDOW: usize = 5;

/// Push `sample` into `history` (bounded to [`WINDOW`]) and return the median
/// of what is kept.
pub fn smooth(history: &mut VecDeque<f64>, sample: f64) -> f64 {
    history.push_back(sample);
    while history.len() > WINDOW {
        history.pop_front();
    }

    let mut sorted: Vec<f64> = history.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
