//! Numeric matrix containers produced by the reader and accepted by the
//! writer.
//!
//! Dense data uses `ndarray`. Sparse data is held in two small formats:
//! [`CsrMatrix`] for reads, where rows are walked one entity at a time, and
//! [`CooMatrix`] for writes, where callers usually produce loose triplets.

use crate::error::{NotochordError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Storage layout requested from the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixLayout {
    #[default]
    Dense,
    Sparse,
}

/// Compressed sparse row matrix of `f32`.
///
/// Entries absent from the structure are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    shape: (usize, usize),
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f32>,
}

impl CsrMatrix {
    /// An all-zero matrix.
    pub fn zeros(shape: (usize, usize)) -> Self {
        Self {
            shape,
            indptr: vec![0; shape.0 + 1],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Build from `(row, col, value)` triplets in any order. Duplicate
    /// coordinates are summed.
    pub fn from_triplets(shape: (usize, usize), triplets: &[(usize, usize, f32)]) -> Result<Self> {
        let (nrows, ncols) = shape;
        if let Some(&(r, c, _)) = triplets.iter().find(|(r, c, _)| *r >= nrows || *c >= ncols) {
            return Err(NotochordError::ShapeMismatch {
                expected: format!("indices within {:?}", shape),
                actual: format!("({}, {})", r, c),
            });
        }

        let mut sorted = triplets.to_vec();
        sorted.sort_unstable_by_key(|&(r, c, _)| (r, c));

        let mut indptr = vec![0; nrows + 1];
        let mut indices = Vec::with_capacity(sorted.len());
        let mut data: Vec<f32> = Vec::with_capacity(sorted.len());
        let mut last: Option<(usize, usize)> = None;

        for (r, c, v) in sorted {
            if last == Some((r, c)) {
                if let Some(tail) = data.last_mut() {
                    *tail += v;
                }
                continue;
            }
            indices.push(c);
            data.push(v);
            indptr[r + 1] += 1;
            last = Some((r, c));
        }
        for it in 0..nrows {
            indptr[it + 1] += indptr[it];
        }

        Ok(Self {
            shape,
            indptr,
            indices,
            data,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Column indices and values stored for one row.
    pub fn row(&self, row: usize) -> (&[usize], &[f32]) {
        if row >= self.shape.0 {
            return (&[], &[]);
        }
        let (start, end) = (self.indptr[row], self.indptr[row + 1]);
        (&self.indices[start..end], &self.data[start..end])
    }

    /// Value at `(row, col)`, zero when not stored.
    pub fn get(&self, row: usize, col: usize) -> f32 {
        let (cols, values) = self.row(row);
        cols.binary_search(&col)
            .map(|it| values[it])
            .unwrap_or(0.0)
    }

    pub fn to_dense(&self) -> Array2<f32> {
        let mut dense = Array2::zeros(self.shape);
        for row in 0..self.shape.0 {
            let (cols, values) = self.row(row);
            for (&col, &value) in cols.iter().zip(values) {
                dense[[row, col]] = value;
            }
        }
        dense
    }
}

/// Coordinate-format sparse matrix of `f64`, used as writer input.
#[derive(Debug, Clone, PartialEq)]
pub struct CooMatrix {
    shape: (usize, usize),
    rows: Vec<usize>,
    cols: Vec<usize>,
    data: Vec<f64>,
}

impl CooMatrix {
    pub fn new(
        shape: (usize, usize),
        rows: Vec<usize>,
        cols: Vec<usize>,
        data: Vec<f64>,
    ) -> Result<Self> {
        if rows.len() != data.len() || cols.len() != data.len() {
            return Err(NotochordError::ShapeMismatch {
                expected: format!("{} row and column indices", data.len()),
                actual: format!("{} rows, {} columns", rows.len(), cols.len()),
            });
        }
        Ok(Self {
            shape,
            rows,
            cols,
            data,
        })
    }

    /// Build from triplets, inferring the smallest shape that holds them.
    pub fn from_triplets(triplets: impl IntoIterator<Item = (usize, usize, f64)>) -> Self {
        let mut coo = Self {
            shape: (0, 0),
            rows: Vec::new(),
            cols: Vec::new(),
            data: Vec::new(),
        };
        for (r, c, v) in triplets {
            coo.shape = (coo.shape.0.max(r + 1), coo.shape.1.max(c + 1));
            coo.rows.push(r);
            coo.cols.push(c);
            coo.data.push(v);
        }
        coo
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Stored `(row, col, value)` entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.rows
            .iter()
            .zip(&self.cols)
            .zip(&self.data)
            .map(|((&r, &c), &v)| (r, c, v))
    }
}

/// One chunk of feature values, rows in entity order and columns in input
/// feature order.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureMatrix {
    Dense(Array2<f32>),
    Sparse(CsrMatrix),
}

impl FeatureMatrix {
    /// Materialize triplets into the requested layout. Unlisted cells are
    /// zero.
    pub fn from_triplets(
        layout: MatrixLayout,
        shape: (usize, usize),
        triplets: &[(usize, usize, f32)],
    ) -> Result<Self> {
        match layout {
            MatrixLayout::Sparse => Ok(FeatureMatrix::Sparse(CsrMatrix::from_triplets(
                shape, triplets,
            )?)),
            MatrixLayout::Dense => {
                let mut dense = Array2::<f32>::zeros(shape);
                for &(r, c, v) in triplets {
                    let cell = dense.get_mut([r, c]).ok_or_else(|| NotochordError::ShapeMismatch {
                        expected: format!("indices within {:?}", shape),
                        actual: format!("({}, {})", r, c),
                    })?;
                    *cell = v;
                }
                Ok(FeatureMatrix::Dense(dense))
            }
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        match self {
            FeatureMatrix::Dense(dense) => dense.dim(),
            FeatureMatrix::Sparse(sparse) => sparse.shape(),
        }
    }

    pub fn nrows(&self) -> usize {
        self.shape().0
    }

    pub fn ncols(&self) -> usize {
        self.shape().1
    }

    pub fn layout(&self) -> MatrixLayout {
        match self {
            FeatureMatrix::Dense(_) => MatrixLayout::Dense,
            FeatureMatrix::Sparse(_) => MatrixLayout::Sparse,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        match self {
            FeatureMatrix::Dense(dense) => dense.get([row, col]).copied().unwrap_or(0.0),
            FeatureMatrix::Sparse(sparse) => sparse.get(row, col),
        }
    }

    pub fn to_dense(&self) -> Array2<f32> {
        match self {
            FeatureMatrix::Dense(dense) => dense.clone(),
            FeatureMatrix::Sparse(sparse) => sparse.to_dense(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_from_unsorted_triplets() {
        let csr = CsrMatrix::from_triplets(
            (3, 4),
            &[(2, 1, 5.0), (0, 3, 1.0), (0, 0, 2.0), (2, 1, 1.0)],
        )
        .unwrap();

        assert_eq!(csr.nnz(), 3);
        assert_eq!(csr.indptr(), &[0, 2, 2, 3]);
        assert_eq!(csr.row(0), (&[0, 3][..], &[2.0, 1.0][..]));
        assert_eq!(csr.get(2, 1), 6.0);
        assert_eq!(csr.get(1, 1), 0.0);
        assert_eq!(csr.row(9), (&[][..], &[][..]));
    }

    #[test]
    fn test_csr_rejects_out_of_bounds() {
        let err = CsrMatrix::from_triplets((2, 2), &[(0, 2, 1.0)]).unwrap_err();
        assert!(matches!(err, NotochordError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_dense_and_sparse_agree() {
        let triplets = [(0, 1, 0.5), (1, 0, 1.5), (3, 2, 2.0)];
        let dense = FeatureMatrix::from_triplets(MatrixLayout::Dense, (4, 3), &triplets).unwrap();
        let sparse = FeatureMatrix::from_triplets(MatrixLayout::Sparse, (4, 3), &triplets).unwrap();

        assert_eq!(dense.shape(), (4, 3));
        assert_eq!(sparse.shape(), (4, 3));
        assert_eq!(dense.to_dense(), sparse.to_dense());
        // Row 2 has no values and stays zero.
        assert!(dense.to_dense().row(2).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_coo_validation() {
        assert!(CooMatrix::new((2, 2), vec![0], vec![0, 1], vec![1.0]).is_err());

        let coo = CooMatrix::from_triplets([(3, 1, 1.0), (0, 4, 2.0)]);
        assert_eq!(coo.shape(), (4, 5));
        assert_eq!(coo.iter().collect::<Vec<_>>(), vec![(3, 1, 1.0), (0, 4, 2.0)]);
    }
}
