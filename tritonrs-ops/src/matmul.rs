use candle_core::Tensor;
use tritonrs_core::{cdiv, Dim3, GridSpec, LaunchRequest, Runtime};

use crate::{
    host::{self, grid_extent},
    Error, Result,
};

pub const MATMUL_KERNEL: &str = "matmul_kernel";

/// `a @ b` for 2-D `a: (M, K)` and `b: (K, N)`, with an optional fused
/// activation applied by the kernel (for example `"leaky_relu"`, or `""` for none).
///
/// Tile sizes come from the kernel's compiled constants, so the grid is
/// resolved from `BLOCK_SIZE_M` and `BLOCK_SIZE_N` at launch time.
pub fn matmul(rt: &Runtime, a: &Tensor, b: &Tensor, activation: &str) -> Result<Tensor> {
    let (m, k) = a.dims2()?;
    let (k_b, n) = b.dims2()?;
    if k != k_b {
        return Err(Error::ShapeMismatch {
            op: "matmul",
            message: format!("lhs {:?} is incompatible with rhs {:?}", a.dims(), b.dims()),
        });
    }
    let c = host::empty((m, n), a.dtype(), a.device())?;

    let a_arg = host::tensor_arg(a)?;
    let b_arg = host::tensor_arg(b)?;
    let c_arg = host::tensor_arg(&c)?;
    let device = a_arg.device;
    let strides = [
        a_arg.strides[0],
        a_arg.strides[1],
        b_arg.strides[0],
        b_arg.strides[1],
        c_arg.strides[0],
        c_arg.strides[1],
    ];

    let grid = GridSpec::deferred(move |meta| {
        let block_m = meta.require_positive("BLOCK_SIZE_M")?;
        let block_n = meta.require_positive("BLOCK_SIZE_N")?;
        let programs = cdiv(m as u64, block_m) * cdiv(n as u64, block_n);
        Ok(Dim3::new(grid_extent(programs)?, 1, 1))
    });

    let request = LaunchRequest::new(grid, device, rt.current_stream(device)?)
        .arg(a_arg)
        .arg(b_arg)
        .arg(c_arg)
        .args([m, n, k])
        .args(strides)
        .kwarg("ACTIVATION", activation);
    rt.launch(MATMUL_KERNEL, request)?;
    Ok(c)
}
