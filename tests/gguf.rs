//! Container round-trips: typed metadata, tensor payloads, alignment
//! padding, and version-1 compatibility.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use llm_compute::gguf::{GgufFile, TensorInfo};
use llm_compute::quant::quantize_chunk;
use llm_compute::{Context, ContextInit, Dtype, Value};

fn sample_context() -> (Context, Vec<llm_compute::TensorId>) {
    let mut ctx = Context::init(ContextInit::with_mem_size(1 << 20)).unwrap();
    let f = ctx.new_tensor_2d(Dtype::F32, 8, 2).unwrap();
    let values: Vec<f32> = (0..16).map(|i| i as f32 * 0.25).collect();
    ctx.load_f32(f, &values);
    ctx.set_name(f, "weights.dense");

    let h = ctx.new_tensor_1d(Dtype::F16, 4).unwrap();
    for i in 0..4 {
        ctx.set_f32_1d(h, i, i as f32 - 1.5);
    }
    ctx.set_name(h, "weights.half");

    let q = ctx.new_tensor_1d(Dtype::Q4_0, 64).unwrap();
    let qsrc: Vec<f32> = (0..64).map(|i| (i as f32 * 0.3).sin()).collect();
    let mut hist = [0i64; 16];
    quantize_chunk(Dtype::Q4_0, &qsrc, ctx.data_mut(q), 0, 64, &mut hist);
    ctx.set_name(q, "weights.q4");

    (ctx, vec![f, h, q])
}

fn sample_metadata() -> BTreeMap<String, Value> {
    let mut kv = BTreeMap::new();
    kv.insert("general.name".to_string(), Value::String("round-trip".to_string()));
    kv.insert("general.alignment".to_string(), Value::U32(32));
    kv.insert("test.count".to_string(), Value::U64(3));
    kv.insert("test.rate".to_string(), Value::F32(0.125));
    kv.insert("test.flag".to_string(), Value::Bool(true));
    kv.insert(
        "test.layers".to_string(),
        Value::Array(vec![Value::I32(1), Value::I32(2), Value::I32(3)]),
    );
    kv
}

#[test]
fn round_trip_preserves_payloads_and_metadata() {
    let (ctx, tensors) = sample_context();
    let kv = sample_metadata();
    let mut file = Vec::new();
    ctx.write_gguf(&mut file, &kv, &tensors).unwrap();

    let parsed = GgufFile::read(&mut Cursor::new(&file)).unwrap();
    assert_eq!(parsed.metadata, kv);
    assert_eq!(parsed.tensors.len(), 3);
    assert_eq!(parsed.alignment, 32);
    assert_eq!(parsed.tensor_data_offset % 32, 0);

    let mut cursor = Cursor::new(&file);
    for (info, &id) in parsed.tensors.iter().zip(&tensors) {
        let t = ctx.tensor(id);
        assert_eq!(info.name, t.name);
        assert_eq!(info.dtype, t.dtype);
        assert_eq!(info.ne, t.ne[..t.n_dims].to_vec());
        assert_eq!(info.offset % 32, 0);
        let payload = parsed.read_tensor_data(&mut cursor, info).unwrap();
        assert_eq!(payload, ctx.data(id), "payload mismatch for '{}'", info.name);
    }
}

#[test]
fn padding_bytes_are_zero() {
    let (ctx, tensors) = sample_context();
    let kv = sample_metadata();
    let mut file = Vec::new();
    ctx.write_gguf(&mut file, &kv, &tensors).unwrap();

    let parsed = GgufFile::read(&mut Cursor::new(&file)).unwrap();
    let data_start = parsed.tensor_data_offset as usize;
    // every inter-payload gap
    for pair in parsed.tensors.windows(2) {
        let end = data_start + pair[0].offset as usize + pair[0].nbytes();
        let next = data_start + pair[1].offset as usize;
        assert!(end <= next);
        assert!(file[end..next].iter().all(|&b| b == 0));
    }
    // trailing padding after the last payload
    let last = parsed.tensors.last().unwrap();
    let end = data_start + last.offset as usize + last.nbytes();
    assert!(file[end..].iter().all(|&b| b == 0));
}

#[test]
fn loads_tensors_into_a_fresh_context() {
    let (ctx, tensors) = sample_context();
    let kv = sample_metadata();
    let mut file = Vec::new();
    ctx.write_gguf(&mut file, &kv, &tensors).unwrap();

    let mut cursor = Cursor::new(&file);
    let parsed = GgufFile::read(&mut cursor).unwrap();
    let loaded = parsed.load_context(&mut cursor).unwrap();
    assert_eq!(loaded.n_tensors(), 3);
    // dequantized contents survive the trip
    let restored_id = loaded.find_tensor("weights.q4").unwrap();
    assert_eq!(ctx.to_vec_f32(tensors[2]), loaded.to_vec_f32(restored_id));
}

#[test]
fn writes_to_disk_and_reads_back() -> anyhow::Result<()> {
    let (ctx, tensors) = sample_context();
    let kv = sample_metadata();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("weights.gguf");
    {
        let mut file = std::fs::File::create(&path)?;
        let mut bytes = Vec::new();
        ctx.write_gguf(&mut bytes, &kv, &tensors)?;
        file.write_all(&bytes)?;
    }
    let parsed = GgufFile::read_path(&path)?;
    assert_eq!(parsed.tensors.len(), 3);
    assert_eq!(parsed.metadata.get("general.name"), Some(&Value::String("round-trip".into())));
    Ok(())
}

/// Metadata values also serialize as JSON (for sidecar manifests and
/// debug dumps), round-tripping through their serde derives.
#[test]
fn metadata_values_round_trip_through_json() -> anyhow::Result<()> {
    let kv = sample_metadata();
    for (key, value) in &kv {
        let json = serde_json::to_string(value)?;
        let back: Value = serde_json::from_str(&json)?;
        assert_eq!(&back, value, "json round-trip changed '{key}'");
    }
    Ok(())
}

/// Hand-built version-1 container (u32 counts and string lengths) with a
/// single `[2]` f32 tensor.
#[test]
fn reads_version_1_containers() {
    let mut file = Vec::new();
    file.extend_from_slice(&0x4655_4747u32.to_le_bytes()); // magic
    file.extend_from_slice(&1u32.to_le_bytes()); // version
    file.extend_from_slice(&1u32.to_le_bytes()); // n_tensors (u32 in v1)
    file.extend_from_slice(&1u32.to_le_bytes()); // n_kv (u32 in v1)

    // kv: "general.name" = "legacy"
    file.extend_from_slice(&12u32.to_le_bytes());
    file.extend_from_slice(b"general.name");
    file.extend_from_slice(&8u32.to_le_bytes()); // string type tag
    file.extend_from_slice(&6u32.to_le_bytes());
    file.extend_from_slice(b"legacy");

    // tensor info: "t" [2] f32 at offset 0
    file.extend_from_slice(&1u32.to_le_bytes());
    file.extend_from_slice(b"t");
    file.extend_from_slice(&1u32.to_le_bytes()); // n_dims
    file.extend_from_slice(&2u32.to_le_bytes()); // ne[0] (u32 in v1)
    file.extend_from_slice(&0u32.to_le_bytes()); // dtype f32
    file.extend_from_slice(&0u64.to_le_bytes()); // offset

    while file.len() % 32 != 0 {
        file.push(0);
    }
    file.extend_from_slice(&1.5f32.to_le_bytes());
    file.extend_from_slice(&(-2.5f32).to_le_bytes());

    let mut cursor = Cursor::new(&file);
    let parsed = GgufFile::read(&mut cursor).unwrap();
    assert_eq!(parsed.metadata.get("general.name"), Some(&Value::String("legacy".into())));
    let info: &TensorInfo = &parsed.tensors[0];
    assert_eq!(info.ne, vec![2]);
    let payload = parsed.read_tensor_data(&mut cursor, info).unwrap();
    assert_eq!(payload.len(), 8);
    assert_eq!(f32::from_le_bytes(payload[0..4].try_into().unwrap()), 1.5);
}

#[test]
fn unknown_dtype_tags_are_rejected() {
    let mut file = Vec::new();
    file.extend_from_slice(&0x4655_4747u32.to_le_bytes());
    file.extend_from_slice(&2u32.to_le_bytes());
    file.extend_from_slice(&1u64.to_le_bytes()); // one tensor
    file.extend_from_slice(&0u64.to_le_bytes()); // no kv
    file.extend_from_slice(&1u64.to_le_bytes());
    file.extend_from_slice(b"t");
    file.extend_from_slice(&1u32.to_le_bytes());
    file.extend_from_slice(&2u64.to_le_bytes());
    file.extend_from_slice(&99u32.to_le_bytes()); // bogus dtype
    file.extend_from_slice(&0u64.to_le_bytes());

    let err = GgufFile::read(&mut Cursor::new(&file)).unwrap_err();
    assert!(matches!(err, llm_compute::ComputeError::UnknownDtype { tag: 99, .. }));
}
