/// One batched read request covering several configured points.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Span<K> {
    pub key: K,
    pub start: u32,
    pub count: u16,
    /// Indices into the adapter's point table
    pub points: Vec<usize>,
}

/// Merge points into as few read requests as the addressing allows.
///
/// `items` is one `(key, start, width)` entry per point, where `key` groups
/// points that can share a request (memory area, device code, register
/// space). Points closer than `max_gap` address units are merged as long as
/// the span stays under `max_len`.
pub(crate) fn plan_spans<K: Copy + Ord>(
    items: &[(K, u32, u16)],
    max_gap: u32,
    max_len: u32,
) -> Vec<Span<K>> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by_key(|&i| (items[i].0, items[i].1));

    let mut spans: Vec<Span<K>> = Vec::new();
    for i in order {
        let (key, start, width) = items[i];
        let end = start + width as u32;

        if let Some(last) = spans.last_mut() {
            let merged = end.saturating_sub(last.start);
            if last.key == key && start <= last.start + last.count as u32 + max_gap && merged <= max_len
            {
                last.count = last.count.max(merged as u16);
                last.points.push(i);
                continue;
            }
        }
        spans.push(Span {
            key,
            start,
            count: width,
            points: vec![i],
        });
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_points_merge() {
        let spans = plan_spans(&[(0u8, 100, 1), (0, 101, 2), (0, 104, 1)], 8, 500);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 100);
        assert_eq!(spans[0].count, 5);
        assert_eq!(spans[0].points, vec![0, 1, 2]);
    }

    #[test]
    fn test_gap_splits_spans() {
        let spans = plan_spans(&[(0u8, 100, 1), (0, 200, 1)], 8, 500);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn test_keys_never_merge() {
        let spans = plan_spans(&[(0u8, 100, 1), (1, 101, 1)], 8, 500);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn test_max_len_respected() {
        let spans = plan_spans(&[(0u8, 0, 1), (0, 4, 1)], 8, 4);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn test_unsorted_input() {
        let spans = plan_spans(&[(0u8, 104, 1), (0, 100, 1)], 8, 500);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].points, vec![1, 0]);
    }
}
