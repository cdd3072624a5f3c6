/// Work-groups needed to cover `elements` invocations.
pub fn dispatch_size(elements: u32, workgroup: u32) -> u32 {
    if elements == 0 {
        0
    } else {
        elements.div_ceil(workgroup.max(1)).max(1)
    }
}

/// Rounds `elements` up to a multiple of `tile`.
pub fn pad_to(elements: u32, tile: u32) -> u32 {
    let tile = tile.max(1);
    elements.div_ceil(tile) * tile
}

/// Copy and map sizes must be multiples of four bytes.
pub fn align_copy_size(bytes: u64) -> u64 {
    (bytes.max(1) + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_size_rounds_up() {
        assert_eq!(dispatch_size(0, 64), 0);
        assert_eq!(dispatch_size(1, 64), 1);
        assert_eq!(dispatch_size(64, 64), 1);
        assert_eq!(dispatch_size(65, 64), 2);
    }

    #[test]
    fn pad_to_multiples() {
        assert_eq!(pad_to(4095, 4), 4096);
        assert_eq!(pad_to(8, 4), 8);
        assert_eq!(pad_to(0, 4), 0);
    }

    #[test]
    fn copy_sizes_are_word_aligned() {
        assert_eq!(align_copy_size(0), 4);
        assert_eq!(align_copy_size(5), 8);
        assert_eq!(align_copy_size(16), 16);
    }
}
