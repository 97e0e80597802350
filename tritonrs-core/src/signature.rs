use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{driver::KernelParam, meta::MetadataMapping, value::Value, Error, Result};

/// The runtime type of a kernel parameter, as recorded by the kernel compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ArgType {
    I1,
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
    /// Any pointer type, such as `*fp32` or `*bf16`.
    Ptr,
}

impl FromStr for ArgType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with('*') {
            return Ok(Self::Ptr);
        }
        match s {
            "i1" => Ok(Self::I1),
            "i8" | "i16" | "i32" => Ok(Self::I32),
            "i64" => Ok(Self::I64),
            "u1" | "u8" | "u16" | "u32" => Ok(Self::U32),
            "u64" => Ok(Self::U64),
            "fp32" | "f32" => Ok(Self::F32),
            "fp64" | "f64" => Ok(Self::F64),
            other => Err(Error::Manifest(format!("unsupported parameter type `{other}`"))),
        }
    }
}

impl TryFrom<String> for ArgType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ArgType> for String {
    fn from(ty: ArgType) -> Self {
        ty.to_string()
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::I1 => "i1",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "fp32",
            Self::F64 => "fp64",
            Self::Ptr => "*",
        };
        f.write_str(s)
    }
}

/// A declared kernel parameter. `ty` is `None` for compile-time constants,
/// which take part in metadata but are not passed at launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Option<ArgType>,
}

impl ParamSpec {
    pub fn runtime(name: impl Into<String>, ty: ArgType) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty),
        }
    }

    pub fn constexpr(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelSignature {
    pub params: Vec<ParamSpec>,
}

impl KernelSignature {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    /// Collect the runtime parameters from `meta`, in declaration order.
    pub fn marshal(&self, meta: &MetadataMapping) -> Result<Vec<KernelParam>> {
        self.params
            .iter()
            .filter_map(|p| p.ty.map(|ty| (p.name.as_str(), ty)))
            .map(|(name, ty)| convert(name, ty, meta.require(name)?))
            .collect()
    }
}

fn mismatch(name: &str, ty: ArgType, value: &Value) -> Error {
    Error::InvalidBinding(format!(
        "parameter `{name}` expects {ty}, got {}",
        value.type_name()
    ))
}

fn int_param<T: TryFrom<i64>>(name: &str, ty: ArgType, value: &Value) -> Result<T> {
    let v = match value {
        Value::Int(v) => *v,
        Value::Bool(b) => *b as i64,
        _ => return Err(mismatch(name, ty, value)),
    };
    T::try_from(v).map_err(|_| {
        Error::InvalidBinding(format!("parameter `{name}` value {v} does not fit {ty}"))
    })
}

fn convert(name: &str, ty: ArgType, value: &Value) -> Result<KernelParam> {
    Ok(match ty {
        ArgType::I1 => match value {
            Value::Bool(b) => KernelParam::I1(*b),
            Value::Int(v @ (0 | 1)) => KernelParam::I1(*v == 1),
            _ => return Err(mismatch(name, ty, value)),
        },
        ArgType::I32 => KernelParam::I32(int_param(name, ty, value)?),
        ArgType::I64 => KernelParam::I64(int_param(name, ty, value)?),
        ArgType::U32 => KernelParam::U32(int_param(name, ty, value)?),
        ArgType::U64 => KernelParam::U64(int_param(name, ty, value)?),
        ArgType::F32 => KernelParam::F32(
            value
                .as_float()
                .ok_or_else(|| mismatch(name, ty, value))? as f32,
        ),
        ArgType::F64 => {
            KernelParam::F64(value.as_float().ok_or_else(|| mismatch(name, ty, value))?)
        }
        ArgType::Ptr => match value {
            Value::Tensor(t) => KernelParam::Ptr(t.ptr),
            _ => return Err(mismatch(name, ty, value)),
        },
    })
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::{
        meta::assemble,
        value::{DataType, Device, TensorArg},
    };

    fn add_signature() -> KernelSignature {
        KernelSignature::new(vec![
            ParamSpec::runtime("x_ptr", ArgType::Ptr),
            ParamSpec::runtime("y_ptr", ArgType::Ptr),
            ParamSpec::runtime("output_ptr", ArgType::Ptr),
            ParamSpec::runtime("n_elements", ArgType::I32),
            ParamSpec::constexpr("BLOCK_SIZE"),
        ])
    }

    fn tensor(ptr: u64) -> Value {
        Value::Tensor(TensorArg {
            ptr,
            shape: vec![8],
            strides: vec![1],
            dtype: DataType::F32,
            device: Device::cuda(0),
        })
    }

    #[test]
    fn test_parses_compiler_type_strings() {
        assert_eq!("*fp32".parse::<ArgType>().unwrap(), ArgType::Ptr);
        assert_eq!("*bf16".parse::<ArgType>().unwrap(), ArgType::Ptr);
        assert_eq!("i32".parse::<ArgType>().unwrap(), ArgType::I32);
        assert_eq!("fp32".parse::<ArgType>().unwrap(), ArgType::F32);
        assert!("tensordesc".parse::<ArgType>().is_err());
    }

    #[test]
    fn test_marshal_skips_constexpr_parameters() {
        let sig = add_signature();
        let args = vec![tensor(0x10), tensor(0x20), tensor(0x30), Value::Int(8), Value::Int(1024)];
        let meta = assemble(&sig.names().collect::<Vec<_>>(), &args, &IndexMap::new()).unwrap();
        let params = sig.marshal(&meta).unwrap();
        assert_eq!(
            params,
            vec![
                KernelParam::Ptr(0x10),
                KernelParam::Ptr(0x20),
                KernelParam::Ptr(0x30),
                KernelParam::I32(8),
            ]
        );
    }

    #[test]
    fn test_marshal_reports_missing_runtime_parameter() {
        let sig = add_signature();
        let meta = assemble(
            &sig.names().collect::<Vec<_>>(),
            &[tensor(1), tensor(2), tensor(3)],
            &IndexMap::new(),
        )
        .unwrap();
        assert!(matches!(
            sig.marshal(&meta),
            Err(Error::MissingMetadata { name }) if name == "n_elements"
        ));
    }

    #[test]
    fn test_marshal_rejects_incompatible_values() {
        let sig = KernelSignature::new(vec![
            ParamSpec::runtime("n", ArgType::I32),
            ParamSpec::runtime("p", ArgType::Ptr),
        ]);
        let names: Vec<_> = sig.names().collect();

        let too_big = assemble(&names, &[Value::Int(1 << 40), tensor(1)], &IndexMap::new()).unwrap();
        assert!(matches!(sig.marshal(&too_big), Err(Error::InvalidBinding(_))));

        let not_ptr = assemble(&names, &[Value::Int(1), Value::Int(2)], &IndexMap::new()).unwrap();
        assert!(matches!(sig.marshal(&not_ptr), Err(Error::InvalidBinding(_))));

        let not_int = assemble(&names, &[Value::from("x"), tensor(1)], &IndexMap::new()).unwrap();
        assert!(matches!(sig.marshal(&not_int), Err(Error::InvalidBinding(_))));
    }

    #[test]
    fn test_signature_round_trips_through_json() {
        let json = r#"[{"name": "x_ptr", "type": "*fp16"}, {"name": "BLOCK", "type": null}]"#;
        let sig: KernelSignature = serde_json::from_str(json).unwrap();
        assert_eq!(
            sig.params,
            vec![ParamSpec::runtime("x_ptr", ArgType::Ptr), ParamSpec::constexpr("BLOCK")]
        );
    }
}
