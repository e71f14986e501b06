//! Identifier and one-time-code generation.

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_id(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Six decimal digits drawn from uuid7 entropy, zero-padded.
pub fn new_otp_code() -> String {
    let bytes = uuid7();
    let bytes = bytes.as_bytes();
    // the tail of a uuid7 is the random portion
    let n = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    format!("{:06}", n % 1_000_000)
}
