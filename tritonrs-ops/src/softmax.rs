use candle_core::Tensor;
use tritonrs_core::{next_power_of_two, Dim3, LaunchRequest, Runtime};

use crate::{
    host::{self, grid_extent},
    Result,
};

pub const SOFTMAX_KERNEL: &str = "softmax_kernel";
const NUM_WARPS: u32 = 8;
const NUM_STAGES: u32 = 4;

/// Row-wise softmax of a 2-D tensor.
///
/// One program per row. The kernel strides over rows by the number of
/// programs, so any grid of at least one program is correct.
pub fn softmax(rt: &Runtime, x: &Tensor) -> Result<Tensor> {
    let x = x.contiguous()?;
    let (n_rows, n_cols) = x.dims2()?;
    let output = host::empty_like(&x)?;

    let x_arg = host::tensor_arg(&x)?;
    let out_arg = host::tensor_arg(&output)?;
    let device = x_arg.device;
    let (in_row_stride, out_row_stride) = (x_arg.strides[0], out_arg.strides[0]);

    let grid = Dim3::new(grid_extent(n_rows as u64)?, 1, 1);
    let request = LaunchRequest::new(grid, device, rt.current_stream(device)?)
        .num_warps(NUM_WARPS)
        .num_stages(NUM_STAGES)
        .arg(out_arg)
        .arg(x_arg)
        .arg(in_row_stride)
        .arg(out_row_stride)
        .arg(n_rows)
        .arg(n_cols)
        .arg(next_power_of_two(n_cols as u64));
    rt.launch(SOFTMAX_KERNEL, request)?;
    Ok(output)
}
