//! Benjamini-Hochberg false discovery rate control.

/// Step-up BH adjusted p-values, returned in input order.
///
/// `adj_(i) = min_{j >= i} (m / j) p_(j)`, clamped to [0, 1]. Non-finite
/// inputs are treated as 1.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len();
    if m == 0 {
        return Vec::new();
    }

    let clean: Vec<f64> = p_values
        .iter()
        .map(|p| if p.is_finite() { p.clamp(0.0, 1.0) } else { 1.0 })
        .collect();

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| clean[a].total_cmp(&clean[b]).then(a.cmp(&b)));

    let mut adjusted = vec![1.0; m];
    let mut running_min: f64 = 1.0;
    for rank in (0..m).rev() {
        let idx = order[rank];
        let candidate = clean[idx] * m as f64 / (rank + 1) as f64;
        running_min = running_min.min(candidate);
        adjusted[idx] = running_min.clamp(0.0, 1.0);
    }
    adjusted
}
