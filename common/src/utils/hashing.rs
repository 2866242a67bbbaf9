//! Content fingerprints used for source deduplication and FAQ diffing.

/// Hex MD5 of raw bytes.
pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Hex MD5 over the concatenation of the given parts.
pub fn md5_of_parts<S: AsRef<str>>(parts: &[S]) -> String {
    let mut ctx = md5::Context::new();
    for part in parts {
        ctx.consume(part.as_ref().as_bytes());
    }
    format!("{:x}", ctx.compute())
}
