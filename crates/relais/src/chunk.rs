//! Slicing an ordered input into indexed chunks.

/// A contiguous slice of the input. Indices run from 0 with no gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub lines: Vec<String>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Lines per chunk: about `fan_out` chunks per worker, never fewer than
/// `min_chunk` lines (and never zero).
pub fn chunk_size(total: usize, workers: usize, fan_out: usize, min_chunk: usize) -> usize {
    let target_chunks = workers.saturating_mul(fan_out).max(1);
    total.div_ceil(target_chunks).max(min_chunk).max(1)
}

/// Split `lines` greedily into chunks of `size`; the last may be shorter.
pub fn slice(lines: Vec<String>, size: usize) -> Vec<Chunk> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(lines.len().div_ceil(size));
    let mut lines = lines.into_iter().peekable();
    while lines.peek().is_some() {
        chunks.push(Chunk {
            index: chunks.len(),
            lines: lines.by_ref().take(size).collect(),
        });
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ligne {}", i)).collect()
    }

    #[test]
    fn floor_applies_to_short_inputs() {
        // 5 lines, 3 workers, fan-out 4 would be ceil(5/12) = 1 line per chunk.
        let size = chunk_size(5, 3, 4, 10);
        assert_eq!(size, 10);

        let chunks = slice(numbered(5), size);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 5);
    }

    #[test]
    fn twenty_three_lines_two_workers() {
        assert_eq!(23_usize.div_ceil(8), 3);
        let size = chunk_size(23, 2, 4, 10);
        assert_eq!(size, 10);

        let chunks = slice(numbered(23), size);
        let sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        let indices: Vec<usize> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn large_inputs_use_fan_out() {
        assert_eq!(chunk_size(1000, 2, 4, 10), 125);
        assert_eq!(chunk_size(1001, 2, 4, 10), 126);
    }

    #[test]
    fn degenerate_parameters_still_make_progress() {
        assert_eq!(chunk_size(0, 0, 0, 0), 1);
        // Zero workers counts as one target chunk.
        assert_eq!(chunk_size(7, 0, 4, 0), 7);
        assert_eq!(chunk_size(7, 1, 0, 0), 7);
        assert_eq!(slice(numbered(3), 0).len(), 3);
    }

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(slice(Vec::new(), 10).is_empty());
    }

    #[test]
    fn slicing_conserves_content() {
        for total in [0, 1, 9, 10, 11, 99, 100, 257] {
            for workers in 1..=4 {
                let input = numbered(total);
                let size = chunk_size(total, workers, 4, 10);
                let chunks = slice(input.clone(), size);

                let count: usize = chunks.iter().map(Chunk::len).sum();
                assert_eq!(count, total);
                assert!(chunks.iter().enumerate().all(|(i, c)| c.index == i));
                assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= size));

                let rebuilt: Vec<String> = chunks.into_iter().flat_map(|c| c.lines).collect();
                assert_eq!(rebuilt, input);
            }
        }
    }
}
