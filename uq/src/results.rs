use serde::Serialize;

/// Final results of a FINISHED calibration session, shaped for the report.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationResults {
    pub metrics: Metrics,
    pub history: History,
    pub raw_data: RawData,
    pub parameters: Parameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    #[serde(rename = "Accuracy")]
    pub accuracy: f64,
    #[serde(rename = "Model Uncertainty Upper Bound")]
    pub model_uncertainty_upper_bound: f64,
    #[serde(rename = "Empirical Coverage")]
    pub empirical_coverage: f64,
    #[serde(rename = "Max Set Size")]
    pub max_set_size: i64,
    #[serde(rename = "Alpha")]
    pub alpha: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub alphas: Vec<f64>,
    pub uncertainty: Vec<f64>,
    pub batch_coverage: Vec<f64>,
    pub batch_setsizes: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RawData {
    pub confidences: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Parameters {
    pub alpha_std: f64,
    #[serde(rename = "U_std")]
    pub u_std: f64,
}

/// Mean over the non-NaN entries; NaN when none remain.
pub fn nan_mean(values: &[f64]) -> f64 {
    let clean: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if clean.is_empty() {
        return f64::NAN;
    }
    clean.iter().sum::<f64>() / clean.len() as f64
}

/// Population standard deviation over the non-NaN entries; NaN when none
/// remain.
pub fn nan_std(values: &[f64]) -> f64 {
    let clean: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if clean.is_empty() {
        return f64::NAN;
    }
    let mean = clean.iter().sum::<f64>() / clean.len() as f64;
    let var = clean.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / clean.len() as f64;
    var.sqrt()
}
