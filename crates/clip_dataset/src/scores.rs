//! Start/end boundary-score targets derived from segments.

use crate::types::Segment;

/// Gaussian bump width as a fraction of the segment length.
const BOUNDARY_SIGMA_RATIO: f32 = 0.1;

/// Per-frame start and end probabilities, `[2, frames]` flattened row-major.
///
/// Each segment contributes a Gaussian centred on its start (row 0) and end
/// (row 1); overlapping bumps keep the maximum. The width never drops below one
/// frame so short segments still mark their boundary frame.
pub fn boundary_scores(segments: &[Segment], frames: usize) -> Vec<f32> {
    let mut scores = vec![0.0f32; 2 * frames];
    if frames == 0 {
        return scores;
    }
    let frame = 1.0 / frames as f32;
    for seg in segments {
        let sigma = (BOUNDARY_SIGMA_RATIO * (seg.end - seg.start)).max(frame);
        for i in 0..frames {
            let x = (i as f32 + 0.5) * frame;
            let start = gaussian(x, seg.start, sigma);
            let end = gaussian(x, seg.end, sigma);
            scores[i] = scores[i].max(start);
            scores[frames + i] = scores[frames + i].max(end);
        }
    }
    scores
}

fn gaussian(x: f32, mu: f32, sigma: f32) -> f32 {
    let d = (x - mu) / sigma;
    (-0.5 * d * d).exp()
}
