//! Wire shapes of values placed on, and read from, operator pins.

use std::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_repr::{Deserialize_repr, Serialize_repr};

use dpf_core::{EntityId, LabelSpace, ObjectKind};

use crate::{Error, Result};

/// Element type of a numeric array payload.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize_repr,
    Deserialize_repr,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u8)]
pub enum ElemType {
    Int32 = 0,
    Double = 1,
    Float = 2,
}

impl ElemType {
    pub fn size(&self) -> usize {
        match self {
            ElemType::Int32 | ElemType::Float => 4,
            ElemType::Double => 8,
        }
    }
}

/// Numeric array payload, little-endian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Array {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub elem_type: ElemType,
    pub count: u64,
}

impl Array {
    pub fn from_i32s(values: &[i32]) -> Self {
        let mut data = vec![0; values.len() * 4];
        LittleEndian::write_i32_into(values, &mut data);
        Self {
            data,
            elem_type: ElemType::Int32,
            count: values.len() as u64,
        }
    }

    /// Packs doubles, optionally downcasting them to 32 bit floats.
    pub fn from_f64s(values: &[f64], as_floats: bool) -> Self {
        if as_floats {
            let floats = values.iter().map(|v| *v as f32).collect::<Vec<f32>>();
            let mut data = vec![0; floats.len() * 4];
            LittleEndian::write_f32_into(&floats, &mut data);
            Self {
                data,
                elem_type: ElemType::Float,
                count: values.len() as u64,
            }
        } else {
            let mut data = vec![0; values.len() * 8];
            LittleEndian::write_f64_into(values, &mut data);
            Self {
                data,
                elem_type: ElemType::Double,
                count: values.len() as u64,
            }
        }
    }

    fn check_len(&self) -> Result<()> {
        let expected = usize::try_from(self.count)
            .ok()
            .and_then(|count| count.checked_mul(self.elem_type.size()))
            .ok_or_else(|| {
                Error::ParseError(format!("array element count out of range: {}", self.count))
            })?;
        if self.data.len() != expected {
            return Err(Error::ParseError(format!(
                "array of {} {:?} elements has {} bytes, expected {}",
                self.count,
                self.elem_type,
                self.data.len(),
                expected
            )));
        }
        Ok(())
    }

    pub fn to_i32s(&self) -> Result<Vec<i32>> {
        self.check_len()?;
        match self.elem_type {
            ElemType::Int32 => {
                let mut out = vec![0; self.count as usize];
                LittleEndian::read_i32_into(&self.data, &mut out);
                Ok(out)
            }
            other => Err(Error::ParseError(format!(
                "expected int32 array, got {:?} array",
                other
            ))),
        }
    }

    /// Unpacks to doubles, widening 32 bit floats and ints.
    pub fn to_f64s(&self) -> Result<Vec<f64>> {
        self.check_len()?;
        let mut out = vec![0.; self.count as usize];
        match self.elem_type {
            ElemType::Double => LittleEndian::read_f64_into(&self.data, &mut out),
            ElemType::Float => {
                let mut floats = vec![0f32; self.count as usize];
                LittleEndian::read_f32_into(&self.data, &mut floats);
                for (o, f) in out.iter_mut().zip(floats) {
                    *o = f as f64;
                }
            }
            ElemType::Int32 => {
                let mut ints = vec![0i32; self.count as usize];
                LittleEndian::read_i32_into(&self.data, &mut ints);
                for (o, i) in out.iter_mut().zip(ints) {
                    *o = i as f64;
                }
            }
        }
        Ok(out)
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Element type code as sent in streamed array headers.
pub fn elem_type_from_code(code: u8) -> Result<ElemType> {
    ElemType::try_from(code).map_err(|e| Error::ParseError(e.to_string()))
}

/// Reference to a server-side object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: EntityId,
    pub kind: ObjectKind,
}

/// Operator-to-operator edge placed on a consumer pin.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorInput {
    pub inputop: EntityId,
    #[serde(rename = "pinOut")]
    pub pin_out: i32,
}

/// A value in its wire encoding. Every client value variant maps to exactly
/// one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Int(i32),
    Double(f64),
    Bool(bool),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Array(Array),
    StringList(Vec<String>),
    Entity(EntityRef),
    OperatorInput(OperatorInput),
    LabelSpace(LabelSpace),
}

impl WireValue {
    /// Short name of the variant, used in error messages.
    pub fn variant_name(&self) -> &'static str {
        match self {
            WireValue::Int(_) => "int32",
            WireValue::Double(_) => "double",
            WireValue::Bool(_) => "bool",
            WireValue::Str(_) => "string",
            WireValue::Bytes(_) => "bytes",
            WireValue::Array(a) => match a.elem_type {
                ElemType::Int32 => "vector<int32>",
                ElemType::Double | ElemType::Float => "vector<double>",
            },
            WireValue::StringList(_) => "vector<string>",
            WireValue::Entity(e) => e.kind.type_name(),
            WireValue::OperatorInput(_) => "operator_output",
            WireValue::LabelSpace(_) => "label_space",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_downcast_to_floats() {
        let a = Array::from_f64s(&[1.5, -2.25, 3.0], true);
        assert_eq!(a.elem_type, ElemType::Float);
        assert_eq!(a.byte_len(), 12);
        assert_eq!(a.to_f64s().unwrap(), vec![1.5, -2.25, 3.0]);
    }

    #[test]
    fn ints_are_little_endian() {
        let a = Array::from_i32s(&[1, 256]);
        assert_eq!(a.data, vec![1, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(a.to_i32s().unwrap(), vec![1, 256]);
        assert!(Array::from_f64s(&[1.], false).to_i32s().is_err());
    }

    #[test]
    fn truncated_arrays_are_rejected() {
        let mut a = Array::from_f64s(&[1., 2.], false);
        a.data.pop();
        assert!(a.to_f64s().is_err());
    }

    #[test]
    fn oversized_counts_are_rejected() {
        let a = Array {
            data: vec![0; 8],
            elem_type: ElemType::Double,
            count: u64::MAX,
        };
        assert!(a.to_f64s().is_err());
        assert!(a.to_i32s().is_err());
    }

    #[test]
    fn elem_type_codes() {
        assert_eq!(elem_type_from_code(1).unwrap(), ElemType::Double);
        assert!(elem_type_from_code(9).is_err());
        let code: u8 = ElemType::Float.into();
        assert_eq!(code, 2);
    }
}
