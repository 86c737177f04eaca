use crate::config::{Number, EPSILON};
use wide::f32x8;

#[inline]
fn lane(s: &[Number]) -> f32x8 {
    f32x8::new([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]])
}

/// Squared Euclidean distance using SIMD operations.
/// Returns `None` when the vectors differ in length.
pub fn squared_l2_simd(a: &[Number], b: &[Number]) -> Option<Number> {
    if a.len() != b.len() {
        return None;
    }

    let mut acc = f32x8::splat(0.0);

    let len = a.len();
    let simd_len = len - (len % 8);

    // SIMD loop
    for i in (0..simd_len).step_by(8) {
        let diff = lane(&a[i..i + 8]) - lane(&b[i..i + 8]);
        acc += diff * diff;
    }

    let mut sum = acc.reduce_add();

    // Handle remaining elements
    for i in simd_len..len {
        let d = a[i] - b[i];
        sum += d * d;
    }

    Some(sum)
}

pub fn squared_l2(a: &[Number], b: &[Number]) -> Option<Number> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum())
}

pub fn normalize_vector(vector: &mut [Number]) {
    let magnitude: Number = vector.iter().map(|&x| x * x).sum::<Number>().sqrt();
    if magnitude > EPSILON {
        for x in vector.iter_mut() {
            *x /= magnitude;
        }
    }
}
