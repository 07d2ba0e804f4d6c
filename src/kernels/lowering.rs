//! im2col-style lowering and its inverse.
//!
//! The lowered matrix is stored row-major with one row per (batch item,
//! output position) pair: row `b*oR*oC + (or*oC + oc)` holds that output
//! position's receptive field in `(d, kr, kc)` order, which is exactly the
//! physical order of one filter slab in a CRDB model cube. Convolution is
//! then one GEMM per image against the filter matrix, and keeping whole
//! per-image row blocks contiguous is what lets both directions run through
//! `DeviceDriver::parallel_map`.

use crate::driver::DeviceDriver;
use crate::CnResult;

/// Index-mapping parameters shared by the lowering pair.
#[derive(Debug, Clone, Copy)]
pub struct LoweringConfig {
    pub kernel: usize,
    pub padding: usize,
    pub stride: usize,
    pub i_r: usize,
    pub i_c: usize,
    pub i_d: usize,
    pub o_r: usize,
    pub o_c: usize,
}

impl LoweringConfig {
    /// Receptive-field length: one lowered row.
    pub fn row_len(&self) -> usize {
        self.kernel * self.kernel * self.i_d
    }

    pub fn rows_per_image(&self) -> usize {
        self.o_r * self.o_c
    }

    /// One image's slab in the input cube.
    pub fn image_len(&self) -> usize {
        self.i_r * self.i_c * self.i_d
    }

    /// One image's block of the lowered matrix.
    pub fn block_len(&self) -> usize {
        self.rows_per_image() * self.row_len()
    }
}

/// Fills `lowered` from `input` for `batch` images. Positions outside the
/// padded input contribute zero.
pub fn lower_cube(
    driver: &dyn DeviceDriver,
    input: &[f32],
    lowered: &mut [f32],
    cfg: &LoweringConfig,
    batch: usize,
) -> CnResult<()> {
    let image = cfg.image_len();
    let block = cfg.block_len();
    let c = *cfg;
    driver.parallel_map(
        &mut lowered[..batch * block],
        &input[..batch * image],
        image,
        &move |src_pos| (src_pos / image) * block,
        &move |_b, img, window| {
            let row_len = c.row_len();
            for orow in 0..c.o_r {
                for ocol in 0..c.o_c {
                    let row = (orow * c.o_c + ocol) * row_len;
                    for d in 0..c.i_d {
                        for kr in 0..c.kernel {
                            let ir = (orow * c.stride + kr) as isize - c.padding as isize;
                            for kc in 0..c.kernel {
                                let ic = (ocol * c.stride + kc) as isize - c.padding as isize;
                                let value = if ir >= 0
                                    && (ir as usize) < c.i_r
                                    && ic >= 0
                                    && (ic as usize) < c.i_c
                                {
                                    img[(d * c.i_r + ir as usize) * c.i_c + ic as usize]
                                } else {
                                    0.0
                                };
                                window[row + (d * c.kernel + kr) * c.kernel + kc] = value;
                            }
                        }
                    }
                }
            }
        },
    )
}

/// Scatters the lowered gradient back into `input_grad`, summing the
/// contributions of overlapping receptive fields. Accumulates on top of
/// whatever is already in `input_grad` (the sweep zeroes it up front, and
/// sibling group bridges may add to the same buffer).
pub fn inverse_lower_cube(
    driver: &dyn DeviceDriver,
    input_grad: &mut [f32],
    lowered: &[f32],
    cfg: &LoweringConfig,
    batch: usize,
) -> CnResult<()> {
    let image = cfg.image_len();
    let block = cfg.block_len();
    let c = *cfg;
    driver.parallel_map(
        &mut input_grad[..batch * image],
        &lowered[..batch * block],
        block,
        &move |src_pos| (src_pos / block) * image,
        &move |_b, low, window| {
            let row_len = c.row_len();
            for d in 0..c.i_d {
                for r in 0..c.i_r {
                    for col in 0..c.i_c {
                        let mut acc = 0.0f32;
                        for kr in 0..c.kernel {
                            let rp = r + c.padding;
                            if rp < kr {
                                continue;
                            }
                            if (rp - kr) % c.stride != 0 {
                                continue;
                            }
                            let orow = (rp - kr) / c.stride;
                            if orow >= c.o_r {
                                continue;
                            }
                            for kc in 0..c.kernel {
                                let cp = col + c.padding;
                                if cp < kc {
                                    continue;
                                }
                                if (cp - kc) % c.stride != 0 {
                                    continue;
                                }
                                let ocol = (cp - kc) / c.stride;
                                if ocol >= c.o_c {
                                    continue;
                                }
                                acc += low[(orow * c.o_c + ocol) * row_len
                                    + (d * c.kernel + kr) * c.kernel
                                    + kc];
                            }
                        }
                        window[(d * c.i_r + r) * c.i_c + col] += acc;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::CpuDriver;

    fn cfg_1x1() -> LoweringConfig {
        LoweringConfig {
            kernel: 2,
            padding: 0,
            stride: 1,
            i_r: 3,
            i_c: 3,
            i_d: 1,
            o_r: 2,
            o_c: 2,
        }
    }

    #[test]
    fn lower_gathers_receptive_fields() {
        let driver = CpuDriver::new();
        let cfg = cfg_1x1();
        let input: Vec<f32> = (0..9).map(|v| v as f32).collect();
        let mut lowered = vec![0.0f32; cfg.block_len()];
        lower_cube(&driver, &input, &mut lowered, &cfg, 1).unwrap();
        // Row 0 is the top-left 2x2 window of [[0,1,2],[3,4,5],[6,7,8]].
        assert_eq!(&lowered[0..4], &[0.0, 1.0, 3.0, 4.0]);
        // Row 3 is the bottom-right window.
        assert_eq!(&lowered[12..16], &[4.0, 5.0, 7.0, 8.0]);
    }

    #[test]
    fn lower_zero_pads_outside() {
        let driver = CpuDriver::new();
        let cfg = LoweringConfig {
            kernel: 3,
            padding: 1,
            stride: 2,
            i_r: 3,
            i_c: 3,
            i_d: 1,
            o_r: 2,
            o_c: 2,
        };
        let input = vec![1.0f32; 9];
        let mut lowered = vec![0.0f32; cfg.block_len()];
        lower_cube(&driver, &input, &mut lowered, &cfg, 1).unwrap();
        // Top-left window is centered at (0,0): first row and column padded.
        assert_eq!(&lowered[0..9], &[0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn inverse_sums_overlapping_fields() {
        let driver = CpuDriver::new();
        let cfg = cfg_1x1();
        let lowered = vec![1.0f32; cfg.block_len()];
        let mut grad = vec![0.0f32; cfg.image_len()];
        inverse_lower_cube(&driver, &mut grad, &lowered, &cfg, 1).unwrap();
        // Center pixel (1,1) is in all four 2x2 windows; corners in one.
        assert_eq!(grad[4], 4.0);
        assert_eq!(grad[0], 1.0);
        assert_eq!(grad[8], 1.0);
        // Total mass is preserved.
        let total: f32 = grad.iter().sum();
        assert_eq!(total, cfg.block_len() as f32);
    }
}
