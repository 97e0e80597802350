use candle_core::Tensor;
use tritonrs_core::{cdiv, Dim3, GridSpec, LaunchRequest, Runtime};

use crate::{
    host::{self, grid_extent},
    Error, Result,
};

pub const ADD_KERNEL: &str = "add_kernel";
pub const BLOCK_SIZE: usize = 1024;

/// Elementwise `x + y`.
pub fn add(rt: &Runtime, x: &Tensor, y: &Tensor) -> Result<Tensor> {
    if x.shape() != y.shape() {
        return Err(Error::ShapeMismatch {
            op: "add",
            message: format!("{:?} vs {:?}", x.dims(), y.dims()),
        });
    }
    let x = x.contiguous()?;
    let y = y.contiguous()?;
    let output = host::empty_like(&x)?;

    let x_arg = host::tensor_arg(&x)?;
    let numel = x_arg.numel();
    let device = x_arg.device;
    let grid = GridSpec::deferred(move |meta| {
        let block = meta.require_positive("BLOCK_SIZE")?;
        Ok(Dim3::new(grid_extent(cdiv(numel as u64, block))?, 1, 1))
    });

    let request = LaunchRequest::new(grid, device, rt.current_stream(device)?)
        .arg(x_arg)
        .arg(host::tensor_arg(&y)?)
        .arg(host::tensor_arg(&output)?)
        .arg(numel)
        .arg(BLOCK_SIZE);
    rt.launch(ADD_KERNEL, request)?;
    Ok(output)
}
