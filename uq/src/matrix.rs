use crate::error::UqError;

/// Row-major `(samples, classes)` probability matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbMatrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl ProbMatrix {
    /// Build from per-sample probability vectors; all rows must agree on the
    /// class count and the batch must be non-empty.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self, UqError> {
        let Some(first) = rows.first() else {
            return Err(UqError::EmptyBatch);
        };
        let cols = first.len();
        if cols == 0 {
            return Err(UqError::EmptyBatch);
        }

        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(UqError::RaggedRows { row: i, expected: cols, got: row.len() });
            }
            data.extend_from_slice(row);
        }

        Ok(Self { data, rows: rows.len(), cols })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Index of the most probable class per sample.
    pub fn argmax(&self) -> Vec<usize> {
        (0..self.rows)
            .map(|i| {
                let row = self.row(i);
                let mut best = 0;
                for (j, &v) in row.iter().enumerate() {
                    if v > row[best] {
                        best = j;
                    }
                }
                best
            })
            .collect()
    }

    /// Highest class probability per sample.
    pub fn row_max(&self) -> Vec<f64> {
        (0..self.rows)
            .map(|i| {
                self.row(i)
                    .iter()
                    .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v)) as f64
            })
            .collect()
    }

    /// Validate that every label addresses a known class and that there is
    /// one label per sample.
    pub fn check_labels(&self, labels: &[i32]) -> Result<(), UqError> {
        if labels.len() != self.rows {
            return Err(UqError::LabelCountMismatch { labels: labels.len(), samples: self.rows });
        }
        for &label in labels {
            if label < 0 || label as usize >= self.cols {
                return Err(UqError::LabelOutOfRange { label, classes: self.cols });
            }
        }
        Ok(())
    }
}
