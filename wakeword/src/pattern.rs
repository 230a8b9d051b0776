//! Energy-contour math for the "hey howdy" matcher.

/// Normalized energy contour of "hey howdy": a short "hey", a dip, then the
/// two-syllable "how-dy".
pub const HEY_HOWDY: [f32; 11] = [0.3, 0.7, 0.4, 0.2, 0.1, 0.4, 0.8, 0.5, 0.6, 0.3, 0.1];

/// Linearly resample `src` onto `dst.len()` evenly spaced points.
pub fn resample_into(src: &[f32], dst: &mut [f32]) {
    match (src.len(), dst.len()) {
        (_, 0) => {}
        (0, _) => dst.fill(0.0),
        (1, _) => dst.fill(src[0]),
        (_, 1) => dst[0] = src[0],
        (n, m) => {
            let step = (n - 1) as f32 / (m - 1) as f32;
            for (i, slot) in dst.iter_mut().enumerate() {
                let pos = i as f32 * step;
                let lo = (pos.floor() as usize).min(n - 1);
                let hi = (lo + 1).min(n - 1);
                let frac = pos - lo as f32;
                *slot = src[lo] * (1.0 - frac) + src[hi] * frac;
            }
        }
    }
}

/// Pearson correlation of two equally long series. Zero when either is flat.
pub fn pearson(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let mean_a = a[..n].iter().sum::<f32>() / n as f32;
    let mean_b = b[..n].iter().sum::<f32>() / n as f32;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a[..n].iter().zip(&b[..n]) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denom = (var_a * var_b).sqrt();
    if denom <= f32::EPSILON {
        0.0
    } else {
        (cov / denom).clamp(-1.0, 1.0)
    }
}

/// Count local maxima above `threshold`.
pub fn count_syllables(values: &[f32], threshold: f32) -> u8 {
    let mut count: u8 = 0;
    for i in 0..values.len() {
        let v = values[i];
        if v <= threshold {
            continue;
        }
        let rising = i == 0 || v > values[i - 1];
        let not_falling_into = i + 1 == values.len() || v >= values[i + 1];
        if rising && not_falling_into {
            count = count.saturating_add(1);
        }
    }
    count
}

pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}
