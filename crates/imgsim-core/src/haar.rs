//! YIQ conversion, the 2-D Haar decomposition, and coefficient selection.
//!
//! The decomposition is the averaging variant: every level scales the
//! detail coefficients by 0.7071 and leaves the sums unscaled, and the DC
//! slot picks up the deferred factors at the end of each pass plus a final
//! division so that it lands on the plane mean scaled by the channel range.
//! The exact constants are load-bearing; scores are only comparable
//! between signatures produced by the same pipeline.

use crate::signature::{NUM_COEFS, NUM_PIXELS, NUM_PIXELS_SQUARED};

/// Per-level detail scaling, applied seven times per pass so the row and
/// column DC slots each end up scaled by ~1/sqrt(128).
const LEVEL_SCALE: f64 = 0.7071;

/// Convert 8-bit RGB planes into YIQ float planes using the transform from
/// standard analog television encoding.
pub(crate) fn rgb_to_yiq(red: &[u8], green: &[u8], blue: &[u8]) -> [Vec<f64>; 3] {
    debug_assert_eq!(red.len(), NUM_PIXELS_SQUARED);
    debug_assert_eq!(green.len(), NUM_PIXELS_SQUARED);
    debug_assert_eq!(blue.len(), NUM_PIXELS_SQUARED);

    let mut y = Vec::with_capacity(NUM_PIXELS_SQUARED);
    let mut i = Vec::with_capacity(NUM_PIXELS_SQUARED);
    let mut q = Vec::with_capacity(NUM_PIXELS_SQUARED);
    for idx in 0..NUM_PIXELS_SQUARED {
        let r = red[idx] as f64;
        let g = green[idx] as f64;
        let b = blue[idx] as f64;
        y.push(0.299 * r + 0.587 * g + 0.114 * b);
        i.push(0.596 * r - 0.275 * g - 0.321 * b);
        q.push(0.212 * r - 0.523 * g + 0.311 * b);
    }
    [y, i, q]
}

/// In-place 2-D Haar decomposition of one 128x128 plane, rows then columns.
pub(crate) fn haar_2d(a: &mut [f64]) {
    assert_eq!(a.len(), NUM_PIXELS_SQUARED);
    let mut t = [0.0f64; NUM_PIXELS / 2];

    // Decompose rows.
    for row in (0..NUM_PIXELS_SQUARED).step_by(NUM_PIXELS) {
        let mut c = 1.0f64;
        let mut h = NUM_PIXELS;
        while h > 1 {
            let h1 = h >> 1;
            c *= LEVEL_SCALE;
            for k in 0..h1 {
                let j = row + 2 * k;
                t[k] = (a[j] - a[j + 1]) * c;
                a[row + k] = a[j] + a[j + 1];
            }
            a[row + h1..row + h].copy_from_slice(&t[..h1]);
            h = h1;
        }
        // Deferred scaling of the row DC slot; c is now ~1/sqrt(128).
        a[row] *= c;
    }

    // Decompose columns.
    for col in 0..NUM_PIXELS {
        let mut c = 1.0f64;
        let mut h = NUM_PIXELS;
        while h > 1 {
            let h1 = h >> 1;
            c *= LEVEL_SCALE;
            for k in 0..h1 {
                let j = col + 2 * k * NUM_PIXELS;
                t[k] = (a[j] - a[j + NUM_PIXELS]) * c;
                a[col + k * NUM_PIXELS] = a[j] + a[j + NUM_PIXELS];
            }
            for k in 0..h1 {
                a[col + (h1 + k) * NUM_PIXELS] = t[k];
            }
            h = h1;
        }
        a[col] *= c;
    }
}

/// Decompose all three YIQ planes and normalize the DC coefficients so
/// they read as channel means over the 0..255 pixel range mapped to unit
/// scale.
pub(crate) fn transform(planes: &mut [Vec<f64>; 3]) {
    for plane in planes.iter_mut() {
        haar_2d(plane);
        plane[0] /= 256.0 * 128.0;
    }
}

/// Select the 40 non-DC coefficients of largest magnitude and encode each
/// as its signed linear position. Ties on magnitude go to the lower
/// position. The result is sorted ascending; position 0 (the DC slot) is
/// excluded and can never appear.
pub(crate) fn largest_coefficients(plane: &[f64]) -> [i32; NUM_COEFS] {
    debug_assert_eq!(plane.len(), NUM_PIXELS_SQUARED);

    let mut positions: Vec<u32> = (1..NUM_PIXELS_SQUARED as u32).collect();
    positions.select_nth_unstable_by(NUM_COEFS - 1, |&a, &b| {
        plane[b as usize]
            .abs()
            .total_cmp(&plane[a as usize].abs())
            .then(a.cmp(&b))
    });

    let mut sig = [0i32; NUM_COEFS];
    for (slot, &pos) in sig.iter_mut().zip(&positions[..NUM_COEFS]) {
        *slot = if plane[pos as usize] < 0.0 {
            -(pos as i32)
        } else {
            pos as i32
        };
    }
    sig.sort_unstable();
    sig
}
