//! Byte-cursor helpers shared by the command codec and the table stores.
//!
//! All integers are big-endian; variable-length fields carry a u32 length
//! prefix. Readers validate lengths before slicing so truncated buffers
//! surface as errors instead of panics.

pub(crate) fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_bytes(out: &mut Vec<u8>, v: &[u8]) {
    put_u32(out, v.len() as u32);
    out.extend_from_slice(v);
}

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= data.len(), "short buffer reading u8");
    let v = data[*offset];
    *offset += 1;
    Ok(v)
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short buffer reading u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short buffer reading u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

pub(crate) fn read_i64(data: &[u8], offset: &mut usize) -> anyhow::Result<i64> {
    Ok(read_u64(data, offset)? as i64)
}

pub(crate) fn read_bytes(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "short buffer reading bytes");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

pub(crate) fn read_string(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes).map_err(|_| anyhow::anyhow!("invalid utf-8 string field"))
}
