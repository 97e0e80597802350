use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tritonrs_core::{
    mock::{MockDriver, RecordedLaunch},
    ArgType, CompiledKernel, Dim3, KernelParam, KernelSet, KernelSignature, ParamSpec, Runtime,
};
use tritonrs_ops::{
    attn_bwd, attn_bwd_preprocess, attn_fwd, matmul, register_ops, softmax, tensor_arg,
    CandleStreams, Error, HostValue, OpNames, Registry, Result,
};

fn sig(runtime: &[(&str, ArgType)], constexprs: &[&str]) -> KernelSignature {
    KernelSignature::new(
        runtime
            .iter()
            .map(|(name, ty)| ParamSpec::runtime(*name, *ty))
            .chain(constexprs.iter().map(|name| ParamSpec::constexpr(*name)))
            .collect(),
    )
}

fn kernel(entry: &str, shared_mem: u32, signature: KernelSignature) -> CompiledKernel {
    CompiledKernel::new(
        entry,
        entry,
        format!("cubin:{entry}").into_bytes(),
        shared_mem,
        4,
        signature,
    )
}

fn kernels() -> KernelSet {
    use ArgType::*;
    [
        kernel(
            "add_kernel",
            0,
            sig(
                &[("x_ptr", Ptr), ("y_ptr", Ptr), ("output_ptr", Ptr), ("n_elements", I32)],
                &["BLOCK_SIZE"],
            ),
        ),
        kernel(
            "softmax_kernel",
            0,
            sig(
                &[
                    ("output_ptr", Ptr),
                    ("input_ptr", Ptr),
                    ("input_row_stride", I32),
                    ("output_row_stride", I32),
                    ("n_rows", I32),
                    ("n_cols", I32),
                ],
                &["BLOCK_SIZE"],
            ),
        ),
        kernel(
            "matmul_kernel",
            65536,
            sig(
                &[
                    ("a_ptr", Ptr),
                    ("b_ptr", Ptr),
                    ("c_ptr", Ptr),
                    ("M", I32),
                    ("N", I32),
                    ("K", I32),
                    ("stride_am", I32),
                    ("stride_ak", I32),
                    ("stride_bk", I32),
                    ("stride_bn", I32),
                    ("stride_cm", I32),
                    ("stride_cn", I32),
                ],
                &["BLOCK_SIZE_M", "BLOCK_SIZE_N", "BLOCK_SIZE_K", "GROUP_SIZE_M", "ACTIVATION"],
            ),
        )
        .with_num_stages(3)
        .with_constant("BLOCK_SIZE_M", 128)
        .with_constant("BLOCK_SIZE_N", 64)
        .with_constant("BLOCK_SIZE_K", 32)
        .with_constant("GROUP_SIZE_M", 8),
        kernel(
            "_attn_fwd",
            114688,
            sig(
                &[
                    ("sm_scale", F32),
                    ("M", Ptr),
                    ("Z", I32),
                    ("H", I32),
                    ("desc_q", Ptr),
                    ("desc_k", Ptr),
                    ("desc_v", Ptr),
                    ("desc_o", Ptr),
                    ("N_CTX", I32),
                ],
                &["HEAD_DIM", "BLOCK_M", "BLOCK_N", "STAGE"],
            ),
        )
        .with_constant("BLOCK_M", 128)
        .with_constant("BLOCK_N", 64),
        kernel(
            "_attn_bwd_preprocess",
            0,
            sig(
                &[("O", Ptr), ("DO", Ptr), ("Delta", Ptr), ("Z", I32), ("H", I32)],
                &["N_CTX", "BLOCK_M", "HEAD_DIM"],
            ),
        ),
        kernel(
            "_attn_bwd",
            98304,
            sig(
                &[
                    ("Q", Ptr),
                    ("K", Ptr),
                    ("V", Ptr),
                    ("sm_scale", F32),
                    ("DO", Ptr),
                    ("DQ", Ptr),
                    ("DK", Ptr),
                    ("DV", Ptr),
                    ("M", Ptr),
                    ("D", Ptr),
                    ("stride_z", I32),
                    ("stride_h", I32),
                    ("stride_tok", I32),
                    ("stride_d", I32),
                    ("H", I32),
                    ("N_CTX", I32),
                ],
                &[
                    "BLOCK_M1",
                    "BLOCK_N1",
                    "BLOCK_M2",
                    "BLOCK_N2",
                    "BLK_SLICE_FACTOR",
                    "HEAD_DIM",
                ],
            ),
        ),
    ]
    .into_iter()
    .collect()
}

fn runtime() -> (Arc<MockDriver>, Runtime) {
    let driver = Arc::new(MockDriver::new());
    let streams = Arc::new(CandleStreams::new());
    let rt = Runtime::new(driver.clone(), streams, kernels());
    (driver, rt)
}

fn only_launch(driver: &MockDriver) -> RecordedLaunch {
    let launches = driver.launches();
    assert_eq!(launches.len(), 1);
    launches.into_iter().next().unwrap()
}

fn ptr(t: &Tensor) -> KernelParam {
    KernelParam::Ptr(tensor_arg(t).unwrap().ptr)
}

#[test]
fn test_add() -> Result<()> {
    let (driver, rt) = runtime();
    let x = Tensor::ones(10000, DType::F32, &Device::Cpu)?;
    let y = Tensor::ones(10000, DType::F32, &Device::Cpu)?;
    let out = tritonrs_ops::add(&rt, &x, &y)?;
    assert_eq!(out.dims(), &[10000]);

    let launch = only_launch(&driver);
    assert_eq!(launch.config.grid, Dim3::new(10, 1, 1));
    assert_eq!(launch.config.block, Dim3::new(128, 1, 1));
    assert_eq!(
        launch.params,
        vec![ptr(&x), ptr(&y), ptr(&out), KernelParam::I32(10000)]
    );
    Ok(())
}

#[test]
fn test_add_shape_mismatch() -> Result<()> {
    let (driver, rt) = runtime();
    let x = Tensor::ones(16, DType::F32, &Device::Cpu)?;
    let y = Tensor::ones(17, DType::F32, &Device::Cpu)?;
    assert!(matches!(
        tritonrs_ops::add(&rt, &x, &y),
        Err(Error::ShapeMismatch { op: "add", .. })
    ));
    assert!(driver.launches().is_empty());
    Ok(())
}

#[test]
fn test_softmax() -> Result<()> {
    let (driver, rt) = runtime();
    let x = Tensor::zeros((1823, 781), DType::F32, &Device::Cpu)?;
    let out = softmax(&rt, &x)?;
    assert_eq!(out.dims(), x.dims());

    let launch = only_launch(&driver);
    assert_eq!(launch.config.grid, Dim3::new(1823, 1, 1));
    assert_eq!(launch.config.block, Dim3::new(256, 1, 1));
    assert_eq!(
        launch.params,
        vec![
            ptr(&out),
            ptr(&x),
            KernelParam::I32(781),
            KernelParam::I32(781),
            KernelParam::I32(1823),
            KernelParam::I32(781),
        ]
    );
    Ok(())
}

#[test]
fn test_matmul_uses_compiled_tile_sizes() -> Result<()> {
    let (driver, rt) = runtime();
    let a = Tensor::zeros((512, 256), DType::F16, &Device::Cpu)?;
    let b = Tensor::zeros((256, 384), DType::F16, &Device::Cpu)?;
    let c = matmul(&rt, &a, &b, "leaky_relu")?;
    assert_eq!(c.dims(), &[512, 384]);
    assert_eq!(c.dtype(), DType::F16);

    let launch = only_launch(&driver);
    assert_eq!(launch.config.grid, Dim3::new(4 * 6, 1, 1));
    assert_eq!(launch.config.shared_mem_bytes, 65536);
    assert_eq!(launch.params.len(), 12);
    assert_eq!(
        launch.params[3..],
        [512, 384, 256, 256, 1, 384, 1, 384, 1].map(KernelParam::I32)
    );
    // 64 KiB exceeds the default limit, so the kernel was opted in.
    assert_eq!(driver.attribute_writes().len(), 1);
    Ok(())
}

#[test]
fn test_matmul_inner_dim_mismatch() -> Result<()> {
    let (driver, rt) = runtime();
    let a = Tensor::zeros((8, 3), DType::F32, &Device::Cpu)?;
    let b = Tensor::zeros((4, 8), DType::F32, &Device::Cpu)?;
    assert!(matches!(
        matmul(&rt, &a, &b, ""),
        Err(Error::ShapeMismatch { op: "matmul", .. })
    ));
    assert_eq!(driver.loads(), 0);
    Ok(())
}

#[test]
fn test_attn_fwd() -> Result<()> {
    let (driver, rt) = runtime();
    let q = Tensor::zeros((2, 4, 1024, 64), DType::F16, &Device::Cpu)?;
    let k = Tensor::zeros((2, 4, 1024, 64), DType::F16, &Device::Cpu)?;
    let v = Tensor::zeros((2, 4, 1024, 64), DType::F16, &Device::Cpu)?;
    let (m, o) = attn_fwd(&rt, &q, &k, &v, true, 0.5)?;
    assert_eq!(m.dims(), &[2, 4, 1024]);
    assert_eq!(m.dtype(), DType::F32);
    assert_eq!(o.dims(), q.dims());

    let launch = only_launch(&driver);
    assert_eq!(launch.config.grid, Dim3::new(8, 8, 1));
    assert_eq!(launch.config.shared_mem_bytes, 114688);
    assert_eq!(
        launch.params,
        vec![
            KernelParam::F32(0.5),
            ptr(&m),
            KernelParam::I32(2),
            KernelParam::I32(4),
            ptr(&q),
            ptr(&k),
            ptr(&v),
            ptr(&o),
            KernelParam::I32(1024),
        ]
    );
    Ok(())
}

#[test]
fn test_attn_fwd_rejects_mismatched_head_dims() -> Result<()> {
    let (_, rt) = runtime();
    let q = Tensor::zeros((1, 2, 128, 64), DType::F32, &Device::Cpu)?;
    let k = Tensor::zeros((1, 2, 128, 32), DType::F32, &Device::Cpu)?;
    assert!(matches!(
        attn_fwd(&rt, &q, &k, &k, false, 1.0),
        Err(Error::ShapeMismatch { op: "attn_fwd", .. })
    ));
    Ok(())
}

#[test]
fn test_attn_bwd_preprocess() -> Result<()> {
    let (driver, rt) = runtime();
    let o = Tensor::zeros((2, 4, 1024, 64), DType::F32, &Device::Cpu)?;
    let d_o = Tensor::zeros((2, 4, 1024, 64), DType::F32, &Device::Cpu)?;
    let delta = attn_bwd_preprocess(&rt, &o, &d_o, &[2, 4, 1024], 64)?;
    assert_eq!(delta.dims(), &[2, 4, 1024]);
    assert_eq!(delta.dtype(), DType::F32);

    let launch = only_launch(&driver);
    assert_eq!(launch.config.grid, Dim3::new(8, 8, 1));
    assert_eq!(
        launch.params,
        vec![ptr(&o), ptr(&d_o), ptr(&delta), KernelParam::I32(2), KernelParam::I32(4)]
    );

    assert!(matches!(
        attn_bwd_preprocess(&rt, &o, &d_o, &[2, 4], 64),
        Err(Error::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_attn_bwd() -> Result<()> {
    let (driver, rt) = runtime();
    let shape = (2, 4, 1024, 64);
    let q = Tensor::zeros(shape, DType::F32, &Device::Cpu)?;
    let k = Tensor::ones(shape, DType::F32, &Device::Cpu)?;
    let v = Tensor::zeros(shape, DType::F32, &Device::Cpu)?;
    let d_o = Tensor::zeros(shape, DType::F32, &Device::Cpu)?;
    let m = Tensor::zeros((2, 4, 1024), DType::F32, &Device::Cpu)?;
    let delta = Tensor::zeros((2, 4, 1024), DType::F32, &Device::Cpu)?;
    let (dq, dk, dv) = attn_bwd(&rt, &q, &k, &v, 0.5, &d_o, &m, &delta, 64)?;
    assert_eq!(dq.dims(), q.dims());
    assert_eq!(dk.dims(), k.dims());
    assert_eq!(dv.dims(), v.dims());

    let launch = only_launch(&driver);
    assert_eq!(launch.config.grid, Dim3::new(8, 1, 8));
    assert_eq!(launch.config.block, Dim3::new(128, 1, 1));
    assert_eq!(launch.params.len(), 16);
    assert_eq!(launch.params[0], ptr(&q));
    // The keys are passed pre-scaled, in a fresh tensor.
    assert_ne!(launch.params[1], ptr(&k));
    assert_eq!(launch.params[3], KernelParam::F32(0.5));
    assert_eq!(launch.params[5], ptr(&dq));
    assert_eq!(
        launch.params[10..],
        [4 * 1024 * 64, 1024 * 64, 64, 1, 4, 1024].map(KernelParam::I32)
    );
    Ok(())
}

#[test]
fn test_registry_dispatch() -> Result<()> {
    let (driver, rt) = runtime();
    let registry = Registry::new();
    register_ops(&registry, &OpNames::default())?;
    assert_eq!(
        registry.names(),
        vec![
            "triton.add",
            "triton.softmax",
            "triton.matmul",
            "triton.attn_fwd",
            "triton.attn_bwd_preprocess",
            "triton.attn_bwd",
        ]
    );

    let x = Tensor::ones(4096, DType::F32, &Device::Cpu)?;
    let out = registry.call("triton.add", &rt, &[HostValue::from(&x), HostValue::from(&x)])?;
    assert_eq!(out.len(), 1);
    assert_eq!(driver.launches()[0].config.grid, Dim3::new(4, 1, 1));

    let q = Tensor::zeros((1, 2, 256, 64), DType::F32, &Device::Cpu)?;
    let out = registry.call(
        "triton.attn_fwd",
        &rt,
        &[
            HostValue::from(&q),
            HostValue::from(&q),
            HostValue::from(&q),
            HostValue::from(false),
            HostValue::from(0.125),
        ],
    )?;
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].dims(), &[1, 2, 256]);
    Ok(())
}

#[test]
fn test_registry_argument_errors() -> Result<()> {
    let (driver, rt) = runtime();
    let registry = Registry::new();
    register_ops(&registry, &OpNames::with_prefix("ext"))?;

    assert!(matches!(
        registry.call("triton.add", &rt, &[]),
        Err(Error::UnknownOp(name)) if name == "triton.add"
    ));
    assert!(matches!(
        registry.call("ext.softmax", &rt, &[]),
        Err(Error::BadArgument { .. })
    ));
    match registry.call("ext.softmax", &rt, &[HostValue::from(3i64)]) {
        Err(Error::BadArgument { op, index, .. }) => {
            assert_eq!(op, "ext.softmax");
            assert_eq!(index, 0);
        }
        other => panic!("expected a bad argument, got {other:?}"),
    }
    assert!(driver.launches().is_empty());
    Ok(())
}

#[test]
fn test_registry_replacement() -> Result<()> {
    let (_, rt) = runtime();
    let registry = Registry::new();
    registry.register("triton.add", |_, _| Ok(vec![]))?;
    registry.register("triton.add", |_, values| {
        Ok(values
            .iter()
            .filter_map(|v| match v {
                HostValue::Tensor(t) => Some(t.clone()),
                _ => None,
            })
            .collect())
    })?;
    let x = Tensor::ones(2, DType::F32, &Device::Cpu)?;
    assert_eq!(registry.call("triton.add", &rt, &[x.into()])?.len(), 1);
    assert_eq!(registry.names().len(), 1);
    Ok(())
}

#[test]
fn test_global_registry() -> Result<()> {
    let registry = tritonrs_ops::registry::init(&OpNames::default())?;
    assert!(registry.contains("triton.matmul"));
    // Later calls keep the first registration.
    tritonrs_ops::registry::init(&OpNames::with_prefix("other"))?;
    assert!(!tritonrs_ops::registry::global().contains("other.matmul"));
    Ok(())
}
