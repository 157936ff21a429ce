//! The back end of the render pipeline: matrix storage for the mode
//! signals, the transpose into time-major order, and the per-time-sample
//! inverse transform that turns accumulated modes into loudspeaker
//! signals.

use num_complex::Complex;
use realfft::ComplexToReal;
use std::sync::Arc;

/// A dense row-major matrix of samples.
#[derive(Clone, Debug, Default)]
pub struct Matrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [f32] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Raw row access for partitioned parallel writes.
    pub(crate) fn rows_ptr(&mut self) -> RowPtr {
        RowPtr {
            base: self.data.as_mut_ptr(),
            rows: self.rows,
            cols: self.cols,
        }
    }
}

/// Raw base pointer of a [`Matrix`], handed to worker partitions.
///
/// Rows are disjoint slices, so concurrent `row_mut` calls are sound as
/// long as no two workers receive the same row index and the matrix
/// outlives the dispatch (the pool blocks until all workers are done).
#[derive(Clone, Copy, Debug)]
pub(crate) struct RowPtr {
    base: *mut f32,
    rows: usize,
    cols: usize,
}

unsafe impl Send for RowPtr {}
unsafe impl Sync for RowPtr {}

impl RowPtr {
    /// # Safety
    /// `row` must be in bounds and not aliased by any other live
    /// reference to the same row.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn row_mut(&self, row: usize) -> &mut [f32] {
        debug_assert!(row < self.rows);
        unsafe { std::slice::from_raw_parts_mut(self.base.add(row * self.cols), self.cols) }
    }
}

/// Transpose `src` into `dst`, whose shape must be the mirror of `src`.
pub fn transpose(src: &Matrix, dst: &mut Matrix) {
    debug_assert_eq!(src.rows, dst.cols);
    debug_assert_eq!(src.cols, dst.rows);
    for r in 0..src.rows {
        let row = src.row(r);
        for (c, &value) in row.iter().enumerate() {
            dst.data[c * dst.cols + r] = value;
        }
    }
}

/// One row's inverse transform: interprets the accumulated mode values
/// at a single time index as a half-complex spectrum over the
/// loudspeaker circle and replaces them with the real loudspeaker
/// samples.
///
/// The half-complex layout matches the accumulator's row assignment:
/// bins 0..=L/2 hold real parts, bin `k`'s imaginary part lives at
/// index `L - k`. The inverse is unnormalized, like FFTW's `HC2R`.
#[derive(Clone)]
pub struct FftStage {
    plan: Arc<dyn ComplexToReal<f32>>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl FftStage {
    pub fn new(plan: Arc<dyn ComplexToReal<f32>>) -> Self {
        let spectrum = plan.make_input_vec();
        let scratch = plan.make_scratch_vec();
        Self {
            plan,
            spectrum,
            scratch,
        }
    }

    /// Transform one row in place. `row` has one value per loudspeaker.
    pub fn process(&mut self, row: &mut [f32]) {
        let len = row.len();
        debug_assert_eq!(len, self.plan.len());

        self.spectrum[0] = Complex::new(row[0], 0.0);
        for k in 1..len.div_ceil(2) {
            self.spectrum[k] = Complex::new(row[k], row[len - k]);
        }
        if len % 2 == 0 {
            self.spectrum[len / 2] = Complex::new(row[len / 2], 0.0);
        }

        self.plan
            .process_with_scratch(&mut self.spectrum, row, &mut self.scratch)
            .expect("spectrum and row lengths match the plan");
    }
}
