/// Byte offsets of consecutive slots in a staging buffer. Slots are packed
/// without padding; every access is unaligned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagingLayout {
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    total: usize,
}

impl StagingLayout {
    pub fn compute(sizes: &[usize]) -> Self {
        let offsets = sizes
            .iter()
            .scan(0usize, |next, size| {
                let offset = *next;
                *next += size;
                Some(offset)
            })
            .collect();
        Self {
            sizes: sizes.to_vec(),
            offsets,
            total: sizes.iter().sum(),
        }
    }

    pub fn offset(&self, index: usize) -> usize {
        self.offsets[index]
    }

    pub fn size(&self, index: usize) -> usize {
        self.sizes[index]
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_prefix_sums() {
        let layout = StagingLayout::compute(&[4, 8, 1, 24]);
        assert_eq!(layout.offsets(), &[0, 4, 12, 13]);
        assert_eq!(layout.total(), 37);
        assert_eq!(layout.size(3), 24);
    }

    #[test]
    fn test_empty_signature() {
        let layout = StagingLayout::compute(&[]);
        assert!(layout.is_empty());
        assert_eq!(layout.total(), 0);
    }
}
