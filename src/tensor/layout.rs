//! Physical layout permutations
//!
//! Channels-last moves dim 1 innermost: `[N, C, *spatial]` is stored as
//! `[N, *spatial, C]`. Blocked splits dim 0 into chunks of `block` rows
//! (zero-padded) and stores the chunk index innermost:
//! `[ceil(O / block), rest, block]`.

/// Logical row-major values to channels-last physical order
pub fn to_channels_last(logical: &[f32], shape: &[usize]) -> Vec<f32> {
    let (n, c, spatial) = split_channels(shape);
    let mut out = vec![0.0f32; logical.len()];
    for b in 0..n {
        for ch in 0..c {
            for s in 0..spatial {
                out[(b * spatial + s) * c + ch] = logical[(b * c + ch) * spatial + s];
            }
        }
    }
    out
}

/// Channels-last physical order back to logical row-major values
pub fn from_channels_last(physical: &[f32], shape: &[usize]) -> Vec<f32> {
    let (n, c, spatial) = split_channels(shape);
    let mut out = vec![0.0f32; physical.len()];
    for b in 0..n {
        for ch in 0..c {
            for s in 0..spatial {
                out[(b * c + ch) * spatial + s] = physical[(b * spatial + s) * c + ch];
            }
        }
    }
    out
}

/// Pack logical values into the blocked layout, padding dim 0 to a multiple of `block`
pub fn pack_blocked(logical: &[f32], shape: &[usize], block: usize) -> Vec<f32> {
    let rows = shape.first().copied().unwrap_or(0);
    let rest: usize = shape.iter().skip(1).product();
    let chunks = blocks_for(rows, block);

    let mut out = vec![0.0f32; chunks * rest * block];
    for r in 0..rows {
        let (chunk, lane) = (r / block, r % block);
        for i in 0..rest {
            out[(chunk * rest + i) * block + lane] = logical[r * rest + i];
        }
    }
    out
}

/// Inverse of [`pack_blocked`]; padding lanes are dropped
pub fn unpack_blocked(physical: &[f32], shape: &[usize], block: usize) -> Vec<f32> {
    let rows = shape.first().copied().unwrap_or(0);
    let rest: usize = shape.iter().skip(1).product();

    let mut out = vec![0.0f32; rows * rest];
    for r in 0..rows {
        let (chunk, lane) = (r / block, r % block);
        for i in 0..rest {
            out[r * rest + i] = physical[(chunk * rest + i) * block + lane];
        }
    }
    out
}

/// Number of `block`-sized chunks needed to cover `rows`
#[inline]
pub fn blocks_for(rows: usize, block: usize) -> usize {
    rows.div_ceil(block)
}

fn split_channels(shape: &[usize]) -> (usize, usize, usize) {
    let n = shape.first().copied().unwrap_or(1);
    let c = shape.get(1).copied().unwrap_or(1);
    let spatial = shape.iter().skip(2).product();
    (n, c, spatial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_channels_last_small() {
        // [1, 2, 2]: channels c0 = [0, 1], c1 = [2, 3]
        let logical = vec![0.0, 1.0, 2.0, 3.0];
        let physical = to_channels_last(&logical, &[1, 2, 2]);
        assert_eq!(physical, vec![0.0, 2.0, 1.0, 3.0]);
        assert_eq!(from_channels_last(&physical, &[1, 2, 2]), logical);
    }

    #[test]
    fn test_blocked_pads_rows() {
        let logical = vec![1.0, 2.0, 3.0];
        let packed = pack_blocked(&logical, &[3, 1], 2);
        assert_eq!(packed, vec![1.0, 2.0, 3.0, 0.0]);
        assert_eq!(unpack_blocked(&packed, &[3, 1], 2), logical);
    }

    proptest! {
        #[test]
        fn prop_blocked_layout_is_lossless(rows in 1usize..9, cols in 1usize..6, block in 1usize..9) {
            let logical: Vec<f32> = (0..rows * cols).map(|v| v as f32).collect();
            let packed = pack_blocked(&logical, &[rows, cols], block);
            prop_assert_eq!(packed.len(), blocks_for(rows, block) * block * cols);
            prop_assert_eq!(unpack_blocked(&packed, &[rows, cols], block), logical);
        }

        #[test]
        fn prop_channels_last_is_lossless(n in 1usize..4, c in 1usize..5, h in 1usize..4, w in 1usize..4) {
            let shape = [n, c, h, w];
            let logical: Vec<f32> = (0..n * c * h * w).map(|v| v as f32).collect();
            let physical = to_channels_last(&logical, &shape);
            prop_assert_eq!(from_channels_last(&physical, &shape), logical);
        }
    }
}
