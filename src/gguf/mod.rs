//! The self-describing container format.
//!
//! Single little-endian file: magic + version, typed key/value metadata,
//! tensor info records, then alignment-padded tensor payloads. Version 1
//! used u32 counts and lengths; versions 2 and 3 use u64. Readers accept
//! all three, writers emit version 2. Padding bytes are zero.

use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::context::{Context, ContextInit};
use crate::error::{ComputeError, ComputeResult};
use crate::tensor::{Dtype, TensorId};

pub const DEFAULT_ALIGNMENT: u32 = 32;
const MAGIC: u32 = 0x4655_4747; // "GGUF"
const WRITER_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
    V3,
}

impl Version {
    fn read<R: Read>(reader: &mut R) -> ComputeResult<Self> {
        let magic = reader.read_u32::<LittleEndian>().map_err(read_err)?;
        if magic != MAGIC {
            return Err(ComputeError::InvalidMagic { magic });
        }
        let version = reader.read_u32::<LittleEndian>().map_err(read_err)?;
        match version {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            version => Err(ComputeError::UnsupportedVersion { version }),
        }
    }

    /// v1 count/length fields are u32, later versions u64.
    fn read_count<R: Read>(self, reader: &mut R) -> ComputeResult<u64> {
        match self {
            Self::V1 => Ok(reader.read_u32::<LittleEndian>().map_err(read_err)? as u64),
            Self::V2 | Self::V3 => reader.read_u64::<LittleEndian>().map_err(read_err),
        }
    }
}

fn read_err(source: std::io::Error) -> ComputeError {
    ComputeError::FileSystem { operation: "read", path: "<container stream>".into(), source }
}

fn write_err(source: std::io::Error) -> ComputeError {
    ComputeError::FileSystem { operation: "write", path: "<container stream>".into(), source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Bool,
    String,
    Array,
}

impl ValueType {
    fn from_u32(v: u32) -> ComputeResult<Self> {
        let v = match v {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            tag => return Err(ComputeError::UnknownValueType { tag }),
        };
        Ok(v)
    }

    fn to_u32(self) -> u32 {
        match self {
            Self::U8 => 0,
            Self::I8 => 1,
            Self::U16 => 2,
            Self::I16 => 3,
            Self::U32 => 4,
            Self::I32 => 5,
            Self::F32 => 6,
            Self::Bool => 7,
            Self::String => 8,
            Self::Array => 9,
            Self::U64 => 10,
            Self::I64 => 11,
            Self::F64 => 12,
        }
    }
}

/// A typed metadata value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::U8(_) => ValueType::U8,
            Self::I8(_) => ValueType::I8,
            Self::U16(_) => ValueType::U16,
            Self::I16(_) => ValueType::I16,
            Self::U32(_) => ValueType::U32,
            Self::I32(_) => ValueType::I32,
            Self::U64(_) => ValueType::U64,
            Self::I64(_) => ValueType::I64,
            Self::F32(_) => ValueType::F32,
            Self::F64(_) => ValueType::F64,
            Self::Bool(_) => ValueType::Bool,
            Self::String(_) => ValueType::String,
            Self::Array(_) => ValueType::Array,
        }
    }

    pub fn to_u32(&self, key: &str) -> ComputeResult<u32> {
        match self {
            Self::U32(v) => Ok(*v),
            Self::U8(v) => Ok(*v as u32),
            Self::U16(v) => Ok(*v as u32),
            _ => Err(ComputeError::MetadataType { key: key.to_string(), expected: "u32" }),
        }
    }

    pub fn to_u64(&self, key: &str) -> ComputeResult<u64> {
        match self {
            Self::U64(v) => Ok(*v),
            Self::U8(v) => Ok(*v as u64),
            Self::U16(v) => Ok(*v as u64),
            Self::U32(v) => Ok(*v as u64),
            Self::Bool(v) => Ok(*v as u64),
            _ => Err(ComputeError::MetadataType { key: key.to_string(), expected: "u64" }),
        }
    }

    pub fn to_f32(&self, key: &str) -> ComputeResult<f32> {
        match self {
            Self::F32(v) => Ok(*v),
            _ => Err(ComputeError::MetadataType { key: key.to_string(), expected: "f32" }),
        }
    }

    pub fn to_bool(&self, key: &str) -> ComputeResult<bool> {
        match self {
            Self::Bool(v) => Ok(*v),
            _ => Err(ComputeError::MetadataType { key: key.to_string(), expected: "bool" }),
        }
    }

    pub fn as_str(&self, key: &str) -> ComputeResult<&str> {
        match self {
            Self::String(v) => Ok(v),
            _ => Err(ComputeError::MetadataType { key: key.to_string(), expected: "string" }),
        }
    }

    fn read<R: Read>(reader: &mut R, ty: ValueType, version: Version) -> ComputeResult<Self> {
        let v = match ty {
            ValueType::U8 => Self::U8(reader.read_u8().map_err(read_err)?),
            ValueType::I8 => Self::I8(reader.read_i8().map_err(read_err)?),
            ValueType::U16 => Self::U16(reader.read_u16::<LittleEndian>().map_err(read_err)?),
            ValueType::I16 => Self::I16(reader.read_i16::<LittleEndian>().map_err(read_err)?),
            ValueType::U32 => Self::U32(reader.read_u32::<LittleEndian>().map_err(read_err)?),
            ValueType::I32 => Self::I32(reader.read_i32::<LittleEndian>().map_err(read_err)?),
            ValueType::U64 => Self::U64(reader.read_u64::<LittleEndian>().map_err(read_err)?),
            ValueType::I64 => Self::I64(reader.read_i64::<LittleEndian>().map_err(read_err)?),
            ValueType::F32 => Self::F32(reader.read_f32::<LittleEndian>().map_err(read_err)?),
            ValueType::F64 => Self::F64(reader.read_f64::<LittleEndian>().map_err(read_err)?),
            ValueType::Bool => match reader.read_u8().map_err(read_err)? {
                0 => Self::Bool(false),
                1 => Self::Bool(true),
                b => {
                    return Err(ComputeError::MalformedContainer {
                        reason: format!("unexpected bool byte {b}"),
                    })
                }
            },
            ValueType::String => Self::String(read_string(reader, version)?),
            ValueType::Array => {
                let elem = ValueType::from_u32(reader.read_u32::<LittleEndian>().map_err(read_err)?)?;
                let len = version.read_count(reader)? as usize;
                let mut values = Vec::with_capacity(len.min(1 << 20));
                for _ in 0..len {
                    values.push(Value::read(reader, elem, version)?);
                }
                Self::Array(values)
            }
        };
        Ok(v)
    }

    fn write<W: Write>(&self, w: &mut W) -> ComputeResult<()> {
        match self {
            Self::U8(v) => w.write_u8(*v).map_err(write_err),
            Self::I8(v) => w.write_i8(*v).map_err(write_err),
            Self::U16(v) => w.write_u16::<LittleEndian>(*v).map_err(write_err),
            Self::I16(v) => w.write_i16::<LittleEndian>(*v).map_err(write_err),
            Self::U32(v) => w.write_u32::<LittleEndian>(*v).map_err(write_err),
            Self::I32(v) => w.write_i32::<LittleEndian>(*v).map_err(write_err),
            Self::U64(v) => w.write_u64::<LittleEndian>(*v).map_err(write_err),
            Self::I64(v) => w.write_i64::<LittleEndian>(*v).map_err(write_err),
            Self::F32(v) => w.write_f32::<LittleEndian>(*v).map_err(write_err),
            Self::F64(v) => w.write_f64::<LittleEndian>(*v).map_err(write_err),
            Self::Bool(v) => w.write_u8(*v as u8).map_err(write_err),
            Self::String(v) => write_string(w, v),
            Self::Array(values) => {
                let elem = values.first().map_or(ValueType::U8, Value::value_type);
                w.write_u32::<LittleEndian>(elem.to_u32()).map_err(write_err)?;
                w.write_u64::<LittleEndian>(values.len() as u64).map_err(write_err)?;
                for v in values {
                    debug_assert_eq!(v.value_type(), elem, "arrays must be homogeneous");
                    v.write(w)?;
                }
                Ok(())
            }
        }
    }
}

fn read_string<R: Read>(reader: &mut R, version: Version) -> ComputeResult<String> {
    let len = version.read_count(reader)? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).map_err(read_err)?;
    // non-null-terminated by contract, but tolerate stray terminators
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_string<W: Write>(w: &mut W, s: &str) -> ComputeResult<()> {
    w.write_u64::<LittleEndian>(s.len() as u64).map_err(write_err)?;
    w.write_all(s.as_bytes()).map_err(write_err)
}

/// One tensor's info record: shape, dtype, and payload offset relative to
/// the data section.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: Dtype,
    pub ne: Vec<usize>,
    pub offset: u64,
}

impl TensorInfo {
    pub fn nelements(&self) -> usize {
        self.ne.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.nelements() / self.dtype.block_size() * self.dtype.type_size()
    }
}

/// A parsed container: metadata, tensor directory, and the byte offset of
/// the data section.
#[derive(Debug)]
pub struct GgufFile {
    pub version: Version,
    pub metadata: BTreeMap<String, Value>,
    pub tensors: Vec<TensorInfo>,
    pub alignment: u64,
    pub tensor_data_offset: u64,
}

impl GgufFile {
    pub fn read<R: Read + Seek>(reader: &mut R) -> ComputeResult<Self> {
        let version = Version::read(reader)?;
        let n_tensors = version.read_count(reader)? as usize;
        let n_kv = version.read_count(reader)? as usize;

        let mut metadata = BTreeMap::new();
        for _ in 0..n_kv {
            let key = read_string(reader, version)?;
            let ty = ValueType::from_u32(reader.read_u32::<LittleEndian>().map_err(read_err)?)?;
            let value = Value::read(reader, ty, version)?;
            metadata.insert(key, value);
        }

        let mut tensors = Vec::with_capacity(n_tensors);
        for _ in 0..n_tensors {
            let name = read_string(reader, version)?;
            let n_dims = reader.read_u32::<LittleEndian>().map_err(read_err)? as usize;
            if !(1..=4).contains(&n_dims) {
                return Err(ComputeError::MalformedContainer {
                    reason: format!("tensor '{name}' has rank {n_dims}"),
                });
            }
            let mut ne = Vec::with_capacity(n_dims);
            for _ in 0..n_dims {
                ne.push(version.read_count(reader)? as usize);
            }
            let tag = reader.read_u32::<LittleEndian>().map_err(read_err)?;
            let dtype = Dtype::from_u32(tag)
                .ok_or_else(|| ComputeError::UnknownDtype { tag, name: name.clone() })?;
            let offset = reader.read_u64::<LittleEndian>().map_err(read_err)?;
            tensors.push(TensorInfo { name, dtype, ne, offset });
        }

        let alignment = match metadata.get("general.alignment") {
            Some(v) => v.to_u64("general.alignment")?,
            None => DEFAULT_ALIGNMENT as u64,
        };
        let position = reader.stream_position().map_err(read_err)?;
        let tensor_data_offset = position.div_ceil(alignment) * alignment;
        Ok(GgufFile { version, metadata, tensors, alignment, tensor_data_offset })
    }

    pub fn read_path(path: &std::path::Path) -> ComputeResult<Self> {
        let file = std::fs::File::open(path).map_err(|source| ComputeError::FileSystem {
            operation: "open",
            path: path.to_path_buf(),
            source,
        })?;
        Self::read(&mut std::io::BufReader::new(file))
    }

    /// Reads one tensor's payload. The reader must be the same stream the
    /// directory was parsed from.
    pub fn read_tensor_data<R: Read + Seek>(
        &self,
        reader: &mut R,
        info: &TensorInfo,
    ) -> ComputeResult<Vec<u8>> {
        reader
            .seek(std::io::SeekFrom::Start(self.tensor_data_offset + info.offset))
            .map_err(read_err)?;
        let mut data = vec![0u8; info.nbytes()];
        reader.read_exact(&mut data).map_err(read_err)?;
        Ok(data)
    }

    /// Materializes every tensor into a fresh context sized to fit.
    pub fn load_context<R: Read + Seek>(&self, reader: &mut R) -> ComputeResult<Context> {
        let total: usize = self.tensors.iter().map(|t| t.nbytes() + 64).sum();
        let mut ctx = Context::init(ContextInit::with_mem_size(total + (1 << 16)))?;
        for info in &self.tensors {
            let id = ctx.new_tensor(info.dtype, &info.ne)?;
            ctx.set_name(id, &info.name);
            let data = self.read_tensor_data(reader, info)?;
            ctx.data_mut(id).copy_from_slice(&data);
        }
        Ok(ctx)
    }
}

impl Context {
    /// Serializes metadata plus the given tensors (which must be
    /// contiguous and named) as a version-2 container.
    pub fn write_gguf<W: Write>(
        &self,
        writer: &mut W,
        metadata: &BTreeMap<String, Value>,
        tensors: &[TensorId],
    ) -> ComputeResult<()> {
        let alignment = match metadata.get("general.alignment") {
            Some(v) => v.to_u64("general.alignment")?,
            None => DEFAULT_ALIGNMENT as u64,
        } as usize;

        let mut header = Vec::new();
        header.write_u32::<LittleEndian>(MAGIC).map_err(write_err)?;
        header.write_u32::<LittleEndian>(WRITER_VERSION).map_err(write_err)?;
        header.write_u64::<LittleEndian>(tensors.len() as u64).map_err(write_err)?;
        header.write_u64::<LittleEndian>(metadata.len() as u64).map_err(write_err)?;
        for (key, value) in metadata {
            write_string(&mut header, key)?;
            header.write_u32::<LittleEndian>(value.value_type().to_u32()).map_err(write_err)?;
            value.write(&mut header)?;
        }

        let mut offset = 0usize;
        for &id in tensors {
            let t = self.tensor(id);
            assert!(t.is_contiguous(), "container tensors must be contiguous");
            assert!(!t.name.is_empty(), "container tensors must be named");
            write_string(&mut header, &t.name)?;
            header.write_u32::<LittleEndian>(t.n_dims as u32).map_err(write_err)?;
            for i in 0..t.n_dims {
                header.write_u64::<LittleEndian>(t.ne[i] as u64).map_err(write_err)?;
            }
            header.write_u32::<LittleEndian>(t.dtype.to_u32()).map_err(write_err)?;
            header.write_u64::<LittleEndian>(offset as u64).map_err(write_err)?;
            offset += t.nbytes().div_ceil(alignment) * alignment;
        }

        writer.write_all(&header).map_err(write_err)?;
        let data_start = header.len().div_ceil(alignment) * alignment;
        writer.write_all(&vec![0u8; data_start - header.len()]).map_err(write_err)?;
        for &id in tensors {
            let data = self.data(id);
            writer.write_all(data).map_err(write_err)?;
            let padded = data.len().div_ceil(alignment) * alignment;
            writer.write_all(&vec![0u8; padded - data.len()]).map_err(write_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 16];
        let err = GgufFile::read(&mut std::io::Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(err, ComputeError::InvalidMagic { magic: 0 }));
    }

    #[test]
    fn value_type_tags_round_trip() {
        for tag in 0..=12u32 {
            assert_eq!(ValueType::from_u32(tag).unwrap().to_u32(), tag);
        }
        assert!(ValueType::from_u32(13).is_err());
    }
}
