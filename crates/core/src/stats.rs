//! Summary statistics used by the measurement coordinators.

/// Arithmetic mean, zero for an empty sample.
pub fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (N - 1 denominator) around `mean`. Zero for
/// fewer than two values.
pub fn standard_deviation(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum / (values.len() - 1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_sample_deviation() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mean = average(&values);
        assert!((mean - 5.0).abs() < 1e-12);
        let expected = (32.0f64 / 7.0).sqrt();
        assert!((standard_deviation(&values, mean) - expected).abs() < 1e-12);
    }

    #[test]
    fn degenerate_samples() {
        assert_eq!(average(&[]), 0.0);
        assert_eq!(standard_deviation(&[3.0], 3.0), 0.0);
    }
}
