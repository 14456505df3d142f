//! Mathematical utility functions.

use statrs::function::gamma::ln_gamma;

/// Clamp a value to a range.
pub fn clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Trigamma function psi'(x) for x > 0.
///
/// Recurrence up to x >= 10, then the asymptotic series.
pub fn trigamma(x: f64) -> f64 {
    if x.is_nan() || x <= 0.0 {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 10.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let x2 = 1.0 / (x * x);
    acc + 1.0 / x
        + x2 / 2.0
        + (1.0 / 6.0 - x2 * (1.0 / 30.0 - x2 * (1.0 / 42.0 - x2 * (1.0 / 30.0)))) * x2 / x
}

/// Log density of NB2 with mean `mu` and size `theta` at count `y`.
pub fn nb_log_density(y: f64, mu: f64, theta: f64) -> f64 {
    let mut ll = ln_gamma(y + theta) - ln_gamma(theta) - ln_gamma(y + 1.0)
        - theta * (mu / theta).ln_1p();
    if y > 0.0 {
        ll += y * (mu.ln() - (mu + theta).ln());
    }
    ll
}

/// Sum of NB2 log densities.
pub fn nb_log_likelihood(y: &[f64], mu: &[f64], theta: f64) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| nb_log_density(yi, mi, theta))
        .sum()
}

/// NB2 residual deviance at fixed theta.
pub fn nb_deviance(y: &[f64], mu: &[f64], theta: f64) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| {
            let a = if yi > 0.0 { yi * (yi / mi).ln() } else { 0.0 };
            2.0 * (a - (yi + theta) * ((yi + theta) / (mi + theta)).ln())
        })
        .sum::<f64>()
        .max(0.0)
}

/// Benjamini-Hochberg adjusted p-values. Missing entries stay missing and do
/// not count towards the number of tests.
pub fn benjamini_hochberg(pvalues: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut idx: Vec<usize> = (0..pvalues.len())
        .filter(|&i| pvalues[i].map_or(false, |p| p.is_finite()))
        .collect();
    let m = idx.len();
    let mut out = vec![None; pvalues.len()];
    if m == 0 {
        return out;
    }
    idx.sort_by(|&a, &b| {
        pvalues[b]
            .unwrap_or(0.0)
            .total_cmp(&pvalues[a].unwrap_or(0.0))
    });
    let mut running = 1.0_f64;
    for (k, &i) in idx.iter().enumerate() {
        let rank = (m - k) as f64;
        let p = pvalues[i].unwrap_or(1.0);
        running = running.min(p * m as f64 / rank);
        out[i] = Some(running.min(1.0));
    }
    out
}
