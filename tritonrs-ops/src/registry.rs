//! Named entry points for the wrappers, callable with dynamically typed arguments.

use std::sync::{Arc, RwLock};

use candle_core::Tensor;
use indexmap::IndexMap;
use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, info, warn};
use tritonrs_core::Runtime;

use crate::{add, attention, config::OpNames, matmul, softmax, Error, Result};

/// An argument passed to a registered operation.
#[derive(Debug, Clone)]
pub enum HostValue {
    Tensor(Tensor),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Shape(Vec<usize>),
}

impl HostValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Str(_) => "str",
            Self::Shape(_) => "shape",
        }
    }
}

impl From<Tensor> for HostValue {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<&Tensor> for HostValue {
    fn from(t: &Tensor) -> Self {
        Self::Tensor(t.clone())
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<Vec<usize>> for HostValue {
    fn from(v: Vec<usize>) -> Self {
        Self::Shape(v)
    }
}

pub type OpFn = Arc<dyn Fn(&Runtime, &[HostValue]) -> Result<Vec<Tensor>> + Send + Sync>;

/// Positional access to the arguments of one call, with errors naming the op.
struct Args<'a> {
    op: &'a str,
    values: &'a [HostValue],
}

impl<'a> Args<'a> {
    fn new(op: &'a str, values: &'a [HostValue], expected: usize) -> Result<Self> {
        if values.len() != expected {
            return Err(Error::BadArgument {
                op: op.to_string(),
                index: values.len(),
                message: format!("expected {expected} arguments, got {}", values.len()),
            });
        }
        Ok(Self { op, values })
    }

    fn bad(&self, index: usize, expected: &str) -> Error {
        Error::BadArgument {
            op: self.op.to_string(),
            index,
            message: format!("expected {expected}, got {}", self.values[index].kind()),
        }
    }

    fn tensor(&self, index: usize) -> Result<&'a Tensor> {
        let values: &'a [HostValue] = self.values;
        match &values[index] {
            HostValue::Tensor(t) => Ok(t),
            _ => Err(self.bad(index, "tensor")),
        }
    }

    fn int(&self, index: usize) -> Result<i64> {
        match self.values[index] {
            HostValue::Int(v) => Ok(v),
            _ => Err(self.bad(index, "int")),
        }
    }

    fn usize(&self, index: usize) -> Result<usize> {
        usize::try_from(self.int(index)?).map_err(|_| self.bad(index, "non-negative int"))
    }

    fn float(&self, index: usize) -> Result<f64> {
        match self.values[index] {
            HostValue::Float(v) => Ok(v),
            HostValue::Int(v) => Ok(v as f64),
            _ => Err(self.bad(index, "float")),
        }
    }

    fn bool(&self, index: usize) -> Result<bool> {
        match self.values[index] {
            HostValue::Bool(v) => Ok(v),
            _ => Err(self.bad(index, "bool")),
        }
    }

    fn str(&self, index: usize) -> Result<&'a str> {
        let values: &'a [HostValue] = self.values;
        match &values[index] {
            HostValue::Str(s) => Ok(s),
            _ => Err(self.bad(index, "str")),
        }
    }

    fn shape(&self, index: usize) -> Result<&'a [usize]> {
        let values: &'a [HostValue] = self.values;
        match &values[index] {
            HostValue::Shape(s) => Ok(s),
            HostValue::Tensor(t) => Ok(t.dims()),
            _ => Err(self.bad(index, "shape")),
        }
    }
}

#[derive(Default)]
pub struct Registry {
    ops: RwLock<IndexMap<String, OpFn>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` as `name`, replacing any earlier registration.
    pub fn register<F>(&self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(&Runtime, &[HostValue]) -> Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut ops = self.ops.write().map_err(|_| poisoned())?;
        if ops.insert(name.clone(), Arc::new(f)).is_some() {
            warn!(op = %name, "replacing registered operation");
        } else {
            debug!(op = %name, "registered operation");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<OpFn> {
        self.ops
            .read()
            .map_err(|_| poisoned())?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownOp(name.to_string()))
    }

    pub fn call(&self, name: &str, rt: &Runtime, args: &[HostValue]) -> Result<Vec<Tensor>> {
        // Clone the entry out so the lock is not held across the launch.
        let op = self.get(name)?;
        op(rt, args)
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.ops
            .read()
            .map(|ops| ops.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.read().is_ok_and(|ops| ops.contains_key(name))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("ops", &self.names())
            .finish()
    }
}

fn poisoned() -> Error {
    tritonrs_core::Error::LockPoisoned("op registry".to_string()).into()
}

/// Register every wrapper under `names`.
pub fn register_ops(registry: &Registry, names: &OpNames) -> Result<()> {
    let op = names.add.clone();
    registry.register(names.add.clone(), move |rt, values| {
        let args = Args::new(&op, values, 2)?;
        Ok(vec![add::add(rt, args.tensor(0)?, args.tensor(1)?)?])
    })?;

    let op = names.softmax.clone();
    registry.register(names.softmax.clone(), move |rt, values| {
        let args = Args::new(&op, values, 1)?;
        Ok(vec![softmax::softmax(rt, args.tensor(0)?)?])
    })?;

    let op = names.matmul.clone();
    registry.register(names.matmul.clone(), move |rt, values| {
        let args = Args::new(&op, values, 3)?;
        Ok(vec![matmul::matmul(
            rt,
            args.tensor(0)?,
            args.tensor(1)?,
            args.str(2)?,
        )?])
    })?;

    let op = names.attn_fwd.clone();
    registry.register(names.attn_fwd.clone(), move |rt, values| {
        let args = Args::new(&op, values, 5)?;
        let (m, o) = attention::attn_fwd(
            rt,
            args.tensor(0)?,
            args.tensor(1)?,
            args.tensor(2)?,
            args.bool(3)?,
            args.float(4)? as f32,
        )?;
        Ok(vec![m, o])
    })?;

    let op = names.attn_bwd_preprocess.clone();
    registry.register(names.attn_bwd_preprocess.clone(), move |rt, values| {
        let args = Args::new(&op, values, 4)?;
        Ok(vec![attention::attn_bwd_preprocess(
            rt,
            args.tensor(0)?,
            args.tensor(1)?,
            args.shape(2)?,
            args.usize(3)?,
        )?])
    })?;

    let op = names.attn_bwd.clone();
    registry.register(names.attn_bwd.clone(), move |rt, values| {
        let args = Args::new(&op, values, 8)?;
        let (dq, dk, dv) = attention::attn_bwd(
            rt,
            args.tensor(0)?,
            args.tensor(1)?,
            args.tensor(2)?,
            args.float(3)?,
            args.tensor(4)?,
            args.tensor(5)?,
            args.tensor(6)?,
            args.usize(7)?,
        )?;
        Ok(vec![dq, dk, dv])
    })?;

    info!(ops = 6, "registered kernel wrappers");
    Ok(())
}

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static INIT: OnceCell<()> = OnceCell::new();

/// The process-wide registry.
pub fn global() -> &'static Registry {
    &REGISTRY
}

/// Fill the process-wide registry. Only the first call registers; later calls
/// are no-ops regardless of `names`.
pub fn init(names: &OpNames) -> Result<&'static Registry> {
    INIT.get_or_try_init(|| register_ops(&REGISTRY, names))?;
    Ok(&REGISTRY)
}
