use std::fmt;

// DType: element types a graph tensor can carry
//
// The loader hands us tensors of whatever type the serialized model uses.
// Embedded models are frequently quantized, so the integer types matter as
// much as the float ones:
//
//   F32  default for float models and for all training tensors
//   F16  half-precision weights
//   F64  reference / test models
//   U8   asymmetric quantized activations and weights
//   I8   symmetric quantized weights
//   I32  quantized bias, index tensors
//   I64  shape and index tensors
//   Bool comparison results and masks

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    F32,
    F64,
    U8,
    I8,
    I32,
    I64,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
            DType::I8 => 1,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    /// Whether this dtype is a floating-point type (the only kind that can carry gradients).
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Whether tensors of this type usually carry affine quantization parameters.
    pub fn is_quantized_int(&self) -> bool {
        matches!(self, DType::U8 | DType::I8)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::I8 => "i8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

// WithDType: Rust element types that can back a tensor buffer
//
// Tensor storage is untyped bytes; typed views go through bytemuck, so every
// element type must be `Pod` as well as map to a DType tag.

/// Trait implemented by Rust types that can be viewed out of tensor storage.
pub trait WithDType:
    Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug + bytemuck::Pod
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

macro_rules! with_dtype_primitive {
    ($t:ty, $dtype:expr) => {
        impl WithDType for $t {
            const DTYPE: DType = $dtype;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
        }
    };
}

with_dtype_primitive!(f32, DType::F32);
with_dtype_primitive!(f64, DType::F64);
with_dtype_primitive!(u8, DType::U8);
with_dtype_primitive!(i8, DType::I8);
with_dtype_primitive!(i32, DType::I32);
with_dtype_primitive!(i64, DType::I64);

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        half::f16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}
