use molt_bind::marshal::{StagingBuffer, StagingLayout};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum SlotValue {
    Byte(u8),
    Word(u32),
    Wide(u64),
    Text(String),
}

impl SlotValue {
    fn size(&self) -> usize {
        match self {
            Self::Byte(_) => size_of::<u8>(),
            Self::Word(_) => size_of::<u32>(),
            Self::Wide(_) => size_of::<u64>(),
            Self::Text(_) => size_of::<String>(),
        }
    }
}

fn slot_value() -> impl Strategy<Value = SlotValue> {
    prop_oneof![
        any::<u8>().prop_map(SlotValue::Byte),
        any::<u32>().prop_map(SlotValue::Word),
        any::<u64>().prop_map(SlotValue::Wide),
        "[a-z]{0,16}".prop_map(SlotValue::Text),
    ]
}

proptest! {
    #[test]
    fn offsets_are_prefix_sums_of_sizes(sizes in prop::collection::vec(0usize..64, 0..16)) {
        let layout = StagingLayout::compute(&sizes);
        prop_assert_eq!(layout.len(), sizes.len());
        prop_assert_eq!(layout.total(), sizes.iter().sum::<usize>());
        let mut expected = 0;
        for (index, size) in sizes.iter().enumerate() {
            prop_assert_eq!(layout.offset(index), expected);
            prop_assert_eq!(layout.size(index), *size);
            expected += size;
        }
    }

    #[test]
    fn slots_keep_their_values_at_unaligned_offsets(values in prop::collection::vec(slot_value(), 1..10)) {
        let sizes: Vec<usize> = values.iter().map(SlotValue::size).collect();
        let layout = StagingLayout::compute(&sizes);
        let mut buffer = StagingBuffer::new(&layout);
        for (index, value) in values.iter().enumerate() {
            unsafe {
                match value.clone() {
                    SlotValue::Byte(v) => buffer.write(index, v, true),
                    SlotValue::Word(v) => buffer.write(index, v, true),
                    SlotValue::Wide(v) => buffer.write(index, v, true),
                    SlotValue::Text(v) => buffer.write(index, v, true),
                }
            }
        }
        // Read back in reverse so every slot is read after all writes.
        for (index, value) in values.iter().enumerate().rev() {
            unsafe {
                match value {
                    SlotValue::Byte(v) => prop_assert_eq!(buffer.read::<u8>(index), *v),
                    SlotValue::Word(v) => prop_assert_eq!(buffer.read::<u32>(index), *v),
                    SlotValue::Wide(v) => prop_assert_eq!(buffer.read::<u64>(index), *v),
                    SlotValue::Text(v) => prop_assert_eq!(&buffer.read::<String>(index), v),
                }
            }
        }
    }
}
