//! NDArray descriptors: metadata for interpreting a shared memory region
//! as a multidimensional array.
//!
//! Only the descriptor crosses the wire, embedded in task inputs/outputs
//! as a `$type`-tagged JSON object. Decoding a descriptor never maps
//! memory; [`NDArray::open`] attaches on demand so that mapping failures
//! surface at the call site as resource errors.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use tandem_core::{Error, Result};

use crate::region::SharedMemory;

const TYPE_KEY: &str = "$type";
const NDARRAY_TAG: &str = "ndarray";
const SHM_TAG: &str = "shm";

/// Element type of an NDArray.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            DType::Int8 | DType::Uint8 | DType::Bool => 1,
            DType::Int16 | DType::Uint16 => 2,
            DType::Int32 | DType::Uint32 | DType::Float32 => 4,
            DType::Int64 | DType::Uint64 | DType::Float64 => 8,
        }
    }

    /// Every supported element type, in a fixed order.
    pub fn all() -> &'static [DType] {
        &[
            DType::Int8,
            DType::Uint8,
            DType::Int16,
            DType::Uint16,
            DType::Int32,
            DType::Uint32,
            DType::Int64,
            DType::Uint64,
            DType::Float32,
            DType::Float64,
            DType::Bool,
        ]
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Int8 => "int8",
            DType::Uint8 => "uint8",
            DType::Int16 => "int16",
            DType::Uint16 => "uint16",
            DType::Int32 => "int32",
            DType::Uint32 => "uint32",
            DType::Int64 => "int64",
            DType::Uint64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Memory layout order: row-major (C) or column-major (F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Order {
    #[default]
    C,
    F,
}

/// Reference to a backing shared memory region: name plus byte length.
/// Shared by both peers, owned by neither message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmToken {
    pub name: String,
    pub size: usize,
}

/// Metadata describing how to read a shared memory region as an array.
#[derive(Debug, Clone, PartialEq)]
pub struct NDArray {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub order: Order,
    pub shm: ShmToken,
}

impl NDArray {
    /// Build a descriptor over an existing region, enforcing the size
    /// invariant: product(shape) * element size must fit in the region.
    pub fn new(dtype: DType, shape: Vec<usize>, order: Order, shm: ShmToken) -> Result<Self> {
        let needed = byte_len(dtype, &shape)?;
        if needed > shm.size {
            return Err(Error::invalid_operation(format!(
                "array of {needed} bytes does not fit region '{}' of {} bytes",
                shm.name, shm.size
            )));
        }
        Ok(Self {
            dtype,
            shape,
            order,
            shm,
        })
    }

    /// Allocate a fresh region sized for `shape` and return the descriptor
    /// together with the writable creator mapping.
    pub fn create(dtype: DType, shape: Vec<usize>) -> Result<(Self, SharedMemory)> {
        let len = byte_len(dtype, &shape)?.max(1);
        let region = SharedMemory::create(None, len)?;
        let descriptor = Self {
            dtype,
            shape,
            order: Order::C,
            shm: ShmToken {
                name: region.name().to_string(),
                size: region.len(),
            },
        };
        Ok((descriptor, region))
    }

    /// Total payload size in bytes.
    pub fn byte_len(&self) -> usize {
        // Validated at construction; cannot overflow here.
        self.shape.iter().product::<usize>() * self.dtype.size_of()
    }

    /// Attach to the backing region.
    pub fn open(&self) -> Result<SharedMemory> {
        SharedMemory::attach(&self.shm.name, self.shm.size)
    }

    /// Encode as a `$type`-tagged JSON value for embedding in task args.
    pub fn to_value(&self) -> Value {
        json!({
            "$type": NDARRAY_TAG,
            "dtype": self.dtype,
            "shape": self.shape,
            "order": self.order,
            "shm": {
                "$type": SHM_TAG,
                "name": self.shm.name,
                "size": self.shm.size,
            },
        })
    }

    /// Decode a `$type`-tagged JSON value produced by [`to_value`](Self::to_value).
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .filter(|o| o.get(TYPE_KEY).and_then(Value::as_str) == Some(NDARRAY_TAG))
            .ok_or_else(|| Error::protocol("value is not an ndarray descriptor"))?;

        let dtype: DType = field(obj, "dtype")?;
        let shape: Vec<usize> = field(obj, "shape")?;
        let order: Order = match obj.get("order") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::protocol(format!("bad ndarray order: {e}")))?,
            None => Order::default(),
        };

        let shm_obj = obj
            .get("shm")
            .and_then(Value::as_object)
            .filter(|o| o.get(TYPE_KEY).and_then(Value::as_str) == Some(SHM_TAG))
            .ok_or_else(|| Error::protocol("ndarray descriptor lacks an shm token"))?;
        let shm = ShmToken {
            name: field(shm_obj, "name")?,
            size: field(shm_obj, "size")?,
        };

        Self::new(dtype, shape, order, shm)
    }

    /// True iff `value` looks like an encoded NDArray descriptor.
    pub fn is_ndarray(value: &Value) -> bool {
        value
            .as_object()
            .and_then(|o| o.get(TYPE_KEY))
            .and_then(Value::as_str)
            == Some(NDARRAY_TAG)
    }
}

fn field<T: serde::de::DeserializeOwned>(
    obj: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<T> {
    let v = obj
        .get(name)
        .ok_or_else(|| Error::protocol(format!("ndarray descriptor lacks '{name}'")))?;
    serde_json::from_value(v.clone())
        .map_err(|e| Error::protocol(format!("bad ndarray '{name}': {e}")))
}

fn byte_len(dtype: DType, shape: &[usize]) -> Result<usize> {
    let mut total = dtype.size_of();
    for &dim in shape {
        total = total
            .checked_mul(dim)
            .ok_or_else(|| Error::invalid_operation("array shape overflows usize"))?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_sizes() {
        assert_eq!(DType::Int8.size_of(), 1);
        assert_eq!(DType::Bool.size_of(), 1);
        assert_eq!(DType::Uint16.size_of(), 2);
        assert_eq!(DType::Float32.size_of(), 4);
        assert_eq!(DType::Uint64.size_of(), 8);
    }

    #[test]
    fn dtype_wire_names() {
        assert_eq!(serde_json::to_string(&DType::Float32).unwrap(), "\"float32\"");
        assert_eq!(serde_json::to_string(&DType::Uint8).unwrap(), "\"uint8\"");
        assert_eq!(DType::Int64.to_string(), "int64");
    }

    #[test]
    fn descriptor_value_round_trip() {
        let arr = NDArray::new(
            DType::Float32,
            vec![7, 512, 512],
            Order::C,
            ShmToken {
                name: "tandem-test".to_string(),
                size: 7 * 512 * 512 * 4,
            },
        )
        .unwrap();
        let value = arr.to_value();
        assert!(NDArray::is_ndarray(&value));
        let back = NDArray::from_value(&value).unwrap();
        assert_eq!(arr, back);
    }

    #[test]
    fn size_invariant_enforced() {
        let err = NDArray::new(
            DType::Int64,
            vec![100],
            Order::C,
            ShmToken {
                name: "tandem-small".to_string(),
                size: 64,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation { .. }));
    }

    #[test]
    fn order_defaults_to_c_on_decode() {
        let value = json!({
            "$type": "ndarray",
            "dtype": "uint8",
            "shape": [4],
            "shm": {"$type": "shm", "name": "tandem-x", "size": 4},
        });
        let arr = NDArray::from_value(&value).unwrap();
        assert_eq!(arr.order, Order::C);
    }

    #[test]
    fn non_descriptor_values_rejected() {
        assert!(!NDArray::is_ndarray(&json!(42)));
        assert!(NDArray::from_value(&json!({"dtype": "uint8"})).is_err());
    }

    #[test]
    fn create_sizes_region_for_shape() {
        for &dtype in DType::all() {
            let (arr, region) = NDArray::create(dtype, vec![3, 5]).unwrap();
            assert_eq!(arr.byte_len(), 15 * dtype.size_of());
            assert!(region.len() >= arr.byte_len());
        }
    }

    #[test]
    fn round_trip_bytes_through_region() {
        let (arr, mut region) = NDArray::create(DType::Uint16, vec![8, 8]).unwrap();
        let pattern: Vec<u8> = (0..arr.byte_len()).map(|i| (i % 251) as u8).collect();
        region.as_mut_slice().unwrap().copy_from_slice(&pattern);

        let attached = arr.open().unwrap();
        assert_eq!(attached.as_slice().unwrap(), &pattern[..]);
    }
}
