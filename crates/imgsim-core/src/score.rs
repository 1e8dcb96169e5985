//! Score arithmetic and the fixed coefficient weight tables.
//!
//! Scoring runs in IEEE 754 single precision throughout; one numeric mode,
//! chosen once. During a query the per-image score accumulates *distance*
//! (lower is better) and is normalized into an approximate 0..100
//! similarity at the end.

use crate::signature::{NUM_PIXELS, NUM_PIXELS_SQUARED};

/// Similarity score type.
pub type Score = f32;

/// Weights for the Haar coefficients, `[sketch][band][channel]`, straight
/// from the referenced paper. `sketch` selects the alternate table tuned
/// for hand-drawn queries; band 0 weighs the DC component, bands 1..=5 the
/// wavelet positions per [`bin_for`].
pub(crate) const WEIGHTS: [[[Score; 3]; 6]; 2] = [
    // Scanned picture.
    //    Y      I      Q
    [
        [5.00, 19.21, 34.37], // DC component
        [0.83, 1.26, 0.36],
        [1.01, 0.44, 0.45],
        [0.52, 0.53, 0.14],
        [0.47, 0.28, 0.18],
        [0.30, 0.14, 0.27],
    ],
    // Hand-drawn or painted sketch.
    [
        [4.04, 15.14, 22.62],
        [0.78, 0.92, 0.40],
        [0.46, 0.53, 0.63],
        [0.42, 0.26, 0.25],
        [0.41, 0.14, 0.15],
        [0.32, 0.07, 0.38],
    ],
];

/// Weight band for every wavelet position. Positions in the top-left 5x5
/// block of the 128x128 grid take band `max(row, col)`; everything else is
/// band 5.
///
/// ```text
///   0 1 2 3 4 5 5 ..
///   1 1 2 3 4 5 5
///   2 2 2 3 4 5 5
///   3 3 3 3 4 5 5
///   4 4 4 4 4 5 5
///   5 5 5 5 5 5 5
/// ```
pub(crate) const BIN: [u8; NUM_PIXELS_SQUARED] = bin_table();

const fn bin_table() -> [u8; NUM_PIXELS_SQUARED] {
    let mut table = [5u8; NUM_PIXELS_SQUARED];
    let mut i = 0;
    while i < 5 {
        let mut j = 0;
        while j < 5 {
            table[i * NUM_PIXELS + j] = (if i > j { i } else { j }) as u8;
            j += 1;
        }
        i += 1;
    }
    table
}

/// Band for a coefficient magnitude (its linearized grid position).
#[inline]
pub(crate) fn bin_for(magnitude: usize) -> usize {
    BIN[magnitude] as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_table_staircase() {
        assert_eq!(BIN[0], 0);
        assert_eq!(BIN[1], 1);
        assert_eq!(BIN[NUM_PIXELS], 1); // (1, 0)
        assert_eq!(BIN[2 * NUM_PIXELS + 4], 4); // (2, 4)
        assert_eq!(BIN[4 * NUM_PIXELS + 4], 4); // (4, 4)
        assert_eq!(BIN[5], 5); // (0, 5) just outside the block
        assert_eq!(BIN[5 * NUM_PIXELS], 5); // (5, 0)
        assert_eq!(BIN[NUM_PIXELS_SQUARED - 1], 5);
    }

    #[test]
    fn test_weights_shape() {
        // DC weights dominate every band in both tables.
        for table in &WEIGHTS {
            for band in 1..6 {
                for c in 0..3 {
                    assert!(table[0][c] > table[band][c]);
                }
            }
        }
    }
}
