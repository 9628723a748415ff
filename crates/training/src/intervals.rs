//! Background intervals between annotated action segments.

use clip_dataset::Segment;

/// Gaps of `[0, 1]` not covered by `segments`, each labelled background (0).
///
/// Emits `[0, first.start]` unless the first segment starts at 0, one interval per
/// adjacent pair, and `[last.end, 1]` unless the last segment ends at 1. Segments
/// are taken as given: no sorting, no overlap checks. An empty input yields the
/// whole clip.
pub fn complement(segments: &[Segment]) -> Vec<Segment> {
    let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
        return vec![Segment::new(0.0, 1.0, 0)];
    };
    let mut out = Vec::with_capacity(segments.len() + 1);
    if first.start != 0.0 {
        out.push(Segment::new(0.0, first.start, 0));
    }
    out.extend(
        segments
            .windows(2)
            .map(|pair| Segment::new(pair[0].end, pair[1].start, 0)),
    );
    if last.end != 1.0 {
        out.push(Segment::new(last.end, 1.0, 0));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(segments: &[Segment]) -> Vec<[f32; 3]> {
        segments
            .iter()
            .map(|s| [s.start, s.end, s.label as f32])
            .collect()
    }

    #[test]
    fn single_inner_segment() {
        let out = complement(&[Segment::new(0.2, 0.5, 3)]);
        assert_eq!(spans(&out), vec![[0.0, 0.2, 0.0], [0.5, 1.0, 0.0]]);
    }

    #[test]
    fn touching_both_edges() {
        let out = complement(&[Segment::new(0.0, 0.3, 1), Segment::new(0.6, 1.0, 2)]);
        assert_eq!(spans(&out), vec![[0.3, 0.6, 0.0]]);
    }

    #[test]
    fn full_clip_has_no_background() {
        assert!(complement(&[Segment::new(0.0, 1.0, 1)]).is_empty());
    }

    #[test]
    fn empty_input_is_whole_clip() {
        assert_eq!(spans(&complement(&[])), vec![[0.0, 1.0, 0.0]]);
    }

    #[test]
    fn count_follows_edge_rule() {
        let cases = [
            (vec![Segment::new(0.1, 0.2, 1), Segment::new(0.4, 0.5, 1)], 3),
            (vec![Segment::new(0.0, 0.2, 1), Segment::new(0.4, 0.5, 1)], 2),
            (vec![Segment::new(0.0, 0.2, 1), Segment::new(0.4, 1.0, 1)], 1),
        ];
        for (segments, expected) in cases {
            assert_eq!(complement(&segments).len(), expected);
        }
    }

    #[test]
    fn union_covers_unit_interval_without_overlap() {
        let segments = vec![
            Segment::new(0.05, 0.2, 1),
            Segment::new(0.2, 0.35, 2),
            Segment::new(0.5, 0.9, 1),
        ];
        let mut all = segments.clone();
        all.extend(complement(&segments));
        all.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.end.total_cmp(&b.end)));

        let mut cursor = 0.0f32;
        let mut covered = 0.0f32;
        for seg in &all {
            assert!(seg.start >= cursor - 1e-6, "overlap at {}", seg.start);
            covered += seg.end - seg.start;
            cursor = seg.end;
        }
        assert!((covered - 1.0).abs() < 1e-6);
        assert!((cursor - 1.0).abs() < 1e-6);
    }
}
