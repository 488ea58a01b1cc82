//! Per-streamline weights (e.g. SIFT2), one non-negative value per streamline.

use csv::{ReaderBuilder, Trim, WriterBuilder};
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Weights(pub Vec<f64>);

impl Weights {
    /// Reads weights separated by commas, whitespace or newlines; `#` starts a comment line.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingInput {
                what: "Weights file",
                path: path.to_path_buf(),
            });
        }
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .delimiter(b',')
            .comment(Some(b'#'))
            .flexible(true)
            .trim(Trim::All)
            .from_path(path)?;

        let mut values = Vec::new();
        for record in reader.records() {
            let record = record?;
            for token in record.iter().flat_map(str::split_whitespace) {
                let value: f64 = token.parse().map_err(|_| Error::InvalidWeight {
                    row: values.len(),
                    value: token.to_string(),
                })?;
                if !value.is_finite() || value < 0.0 {
                    return Err(Error::InvalidWeight {
                        row: values.len(),
                        value: token.to_string(),
                    });
                }
                values.push(value);
            }
        }
        Ok(Weights(values))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .from_path(path.as_ref())?;
        for value in &self.0 {
            writer.write_record([value.to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }

    /// Errors unless there is exactly one weight per streamline.
    pub fn ensure_len(&self, streamlines: usize) -> Result<()> {
        if self.len() == streamlines {
            Ok(())
        } else {
            Err(Error::LengthMismatch {
                what: "weight vector",
                expected: streamlines,
                found: self.len(),
            })
        }
    }

    /// Weights at `indices`, so position i of the result belongs to the i-th retained streamline.
    pub fn subset(&self, indices: &[usize]) -> Weights {
        Weights(indices.iter().map(|&i| self.0[i]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_mrtrix_single_line_and_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sift2.csv");
        std::fs::write(&path, "# command_history: tcksift2 ...\n0.5 1.25 0 3\n").unwrap();
        assert_eq!(Weights::load(&path).unwrap(), Weights(vec![0.5, 1.25, 0.0, 3.0]));
    }

    #[test]
    fn reads_one_value_per_row_and_commas() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.csv");
        std::fs::write(&path, "1.0\n2.0,3.0\n\n4\n").unwrap();
        assert_eq!(Weights::load(&path).unwrap().0, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn negative_weight_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.csv");
        std::fs::write(&path, "1.0\n-2.0\n").unwrap();
        match Weights::load(&path) {
            Err(Error::InvalidWeight { row, .. }) => assert_eq!(row, 1),
            other => panic!("expected InvalidWeight, got {:?}", other),
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let weights = Weights(vec![0.1, 2.5, 7.0]);
        weights.save(&path).unwrap();
        assert_eq!(Weights::load(&path).unwrap(), weights);
    }

    #[test]
    fn subset_follows_indices() {
        let w = Weights(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(w.subset(&[3, 0]).0, vec![4.0, 1.0]);
        assert!(w.ensure_len(3).is_err());
        assert!(w.ensure_len(4).is_ok());
    }
}
