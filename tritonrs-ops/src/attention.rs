//! Fused attention, forward and backward.
//!
//! Tensors are laid out `(Z, H, N_CTX, HEAD_DIM)`: batch, heads, sequence,
//! head dimension. Inputs are made contiguous first; the kernels address
//! every operand with the query's strides.

use std::f64::consts::LN_2;

use candle_core::{DType, Tensor};
use tritonrs_core::{cdiv, Dim3, GridSpec, LaunchRequest, Runtime};

use crate::{
    host::{self, grid_extent},
    Error, Result,
};

pub const ATTN_FWD_KERNEL: &str = "_attn_fwd";
pub const ATTN_BWD_PREPROCESS_KERNEL: &str = "_attn_bwd_preprocess";
pub const ATTN_BWD_KERNEL: &str = "_attn_bwd";

/// Rows of `o` handled by one preprocess program.
const PRE_BLOCK: usize = 128;
const BLOCK_M1: usize = 32;
const BLOCK_N1: usize = 128;
const BLOCK_M2: usize = 128;
const BLOCK_N2: usize = 32;
const BLK_SLICE_FACTOR: usize = 2;

fn check_same_shape(op: &'static str, expected: &Tensor, tensors: &[(&str, &Tensor)]) -> Result<()> {
    for (name, t) in tensors {
        if t.dims() != expected.dims() {
            return Err(Error::ShapeMismatch {
                op,
                message: format!("`{name}` is {:?}, expected {:?}", t.dims(), expected.dims()),
            });
        }
    }
    Ok(())
}

/// Forward pass. Returns `(m, o)` where `m` holds the per-row log-sum-exp
/// statistics, float32 of shape `(Z, H, N_CTX)`, and `o` has the shape of `q`.
pub fn attn_fwd(
    rt: &Runtime,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    causal: bool,
    sm_scale: f32,
) -> Result<(Tensor, Tensor)> {
    let (z, h, n_ctx, _) = q.dims4()?;
    let (_, _, _, head_dim) = k.dims4()?;
    let (_, _, _, head_dim_v) = v.dims4()?;
    if head_dim != q.dim(3)? || head_dim != head_dim_v {
        return Err(Error::ShapeMismatch {
            op: "attn_fwd",
            message: format!(
                "head dims differ: q {:?}, k {:?}, v {:?}",
                q.dims(),
                k.dims(),
                v.dims()
            ),
        });
    }
    let (q, k, v) = (q.contiguous()?, k.contiguous()?, v.contiguous()?);
    let o = host::empty_like(&q)?;
    let m = host::empty((z, h, n_ctx), DType::F32, q.device())?;

    let q_arg = host::tensor_arg(&q)?;
    let device = q_arg.device;
    let heads = z * h;
    let grid = GridSpec::deferred(move |meta| {
        let block_m = meta.require_positive("BLOCK_M")?;
        Ok(Dim3::new(
            grid_extent(cdiv(n_ctx as u64, block_m))?,
            grid_extent(heads as u64)?,
            1,
        ))
    });

    let request = LaunchRequest::new(grid, device, rt.current_stream(device)?)
        .arg(sm_scale)
        .arg(host::tensor_arg(&m)?)
        .args([z, h])
        .arg(q_arg)
        .arg(host::tensor_arg(&k)?)
        .arg(host::tensor_arg(&v)?)
        .arg(host::tensor_arg(&o)?)
        .arg(n_ctx)
        .kwarg("HEAD_DIM", head_dim)
        .kwarg("STAGE", if causal { 3 } else { 1 });
    rt.launch(ATTN_FWD_KERNEL, request)?;
    Ok((m, o))
}

/// Computes `delta = rowsum(o * do)` ahead of the backward pass.
///
/// `m_shape` is the `(Z, H, N_CTX)` shape of the forward statistics; `delta`
/// is float32 with that shape.
pub fn attn_bwd_preprocess(
    rt: &Runtime,
    o: &Tensor,
    d_o: &Tensor,
    m_shape: &[usize],
    head_dim: usize,
) -> Result<Tensor> {
    let &[z, h, n_ctx] = m_shape else {
        return Err(Error::ShapeMismatch {
            op: "attn_bwd_preprocess",
            message: format!("statistics shape must have 3 dims, got {m_shape:?}"),
        });
    };
    check_same_shape("attn_bwd_preprocess", o, &[("do", d_o)])?;
    let (o, d_o) = (o.contiguous()?, d_o.contiguous()?);
    let delta = host::empty(m_shape, DType::F32, o.device())?;

    let o_arg = host::tensor_arg(&o)?;
    let device = o_arg.device;
    let grid = Dim3::new(
        grid_extent((n_ctx / PRE_BLOCK) as u64)?,
        grid_extent((z * h) as u64)?,
        1,
    );
    let request = LaunchRequest::new(grid, device, rt.current_stream(device)?)
        .arg(o_arg)
        .arg(host::tensor_arg(&d_o)?)
        .arg(host::tensor_arg(&delta)?)
        .args([z, h])
        .kwarg("N_CTX", n_ctx)
        .kwarg("BLOCK_M", PRE_BLOCK)
        .kwarg("HEAD_DIM", head_dim);
    rt.launch(ATTN_BWD_PREPROCESS_KERNEL, request)?;
    Ok(delta)
}

/// Backward pass. Returns `(dq, dk, dv)`, shaped like `q`, `k` and `v`.
///
/// `m` and `delta` are the forward statistics and the preprocessed row sums.
#[allow(clippy::too_many_arguments)]
pub fn attn_bwd(
    rt: &Runtime,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    sm_scale: f64,
    d_o: &Tensor,
    m: &Tensor,
    delta: &Tensor,
    head_dim: usize,
) -> Result<(Tensor, Tensor, Tensor)> {
    let (z, h, n_ctx, _) = q.dims4()?;
    check_same_shape("attn_bwd", q, &[("k", k), ("v", v), ("do", d_o)])?;
    check_same_shape("attn_bwd", m, &[("delta", delta)])?;

    let (q, k, v, d_o) = (
        q.contiguous()?,
        k.contiguous()?,
        v.contiguous()?,
        d_o.contiguous()?,
    );
    let (m, delta) = (m.contiguous()?, delta.contiguous()?);
    // The kernel works in base 2, so the keys are pre-scaled by sm_scale / ln 2.
    let arg_k = k.affine(sm_scale / LN_2, 0.)?;
    let dq = host::empty_like(&q)?;
    let dk = host::empty_like(&k)?;
    let dv = host::empty_like(&v)?;

    let q_arg = host::tensor_arg(&q)?;
    let device = q_arg.device;
    let q_strides = q_arg.strides.clone();
    let grid = Dim3::new(
        grid_extent((n_ctx / BLOCK_N1) as u64)?,
        1,
        grid_extent((z * h) as u64)?,
    );

    let request = LaunchRequest::new(grid, device, rt.current_stream(device)?)
        .num_warps(4)
        .num_stages(5)
        .arg(q_arg)
        .arg(host::tensor_arg(&arg_k)?)
        .arg(host::tensor_arg(&v)?)
        .arg(sm_scale)
        .arg(host::tensor_arg(&d_o)?)
        .arg(host::tensor_arg(&dq)?)
        .arg(host::tensor_arg(&dk)?)
        .arg(host::tensor_arg(&dv)?)
        .arg(host::tensor_arg(&m)?)
        .arg(host::tensor_arg(&delta)?)
        .args(q_strides)
        .args([h, n_ctx])
        .kwarg("BLOCK_M1", BLOCK_M1)
        .kwarg("BLOCK_N1", BLOCK_N1)
        .kwarg("BLOCK_M2", BLOCK_M2)
        .kwarg("BLOCK_N2", BLOCK_N2)
        .kwarg("BLK_SLICE_FACTOR", BLK_SLICE_FACTOR)
        .kwarg("HEAD_DIM", head_dim);
    rt.launch(ATTN_BWD_KERNEL, request)?;
    Ok((dq, dk, dv))
}
