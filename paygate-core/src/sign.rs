//! The merchant signing protocol: canonical MD5 over key-value maps.
//!
//! Both inbound merchant requests and outbound notify payloads are signed
//! the same way: drop `sign` / `sign_type` and empty values, sort the
//! remaining keys byte-ascending, join as `k1=v1&k2=v2&...`, append the
//! merchant secret with no separator, MD5, render as 32 lowercase hex
//! digits. Values are NOT URL-encoded; amounts must already be in their
//! canonical two-decimal string form.

use std::collections::BTreeMap;

pub const SIGN_KEY: &str = "sign";
pub const SIGN_TYPE_KEY: &str = "sign_type";
/// The only signature algorithm the merchant protocol speaks.
pub const SIGN_TYPE_MD5: &str = "MD5";

/// The canonical `k1=v1&k2=v2&...` form of a parameter map, with the
/// signature fields and empty values removed and keys byte-sorted.
pub fn canonical_query<'a, I>(params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let filtered = params
        .into_iter()
        .filter(|(k, v)| {
            *k != SIGN_KEY && *k != SIGN_TYPE_KEY && !v.is_empty()
        })
        // BTreeMap gives byte-ascending key order; a duplicate key keeps
        // the last value, like the dynamic maps this protocol grew out of.
        .collect::<BTreeMap<&str, &str>>();

    let mut out = String::new();
    for (i, (k, v)) in filtered.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

/// Sign a parameter map with the merchant secret.
pub fn md5_sign<'a, I>(params: I, secret: &str) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut payload = canonical_query(params);
    payload.push_str(secret);
    format!("{:x}", md5::compute(payload.as_bytes()))
}

/// Verify a claimed signature by recomputing and byte-comparing.
pub fn md5_verify<'a, I>(params: I, secret: &str, sign: &str) -> bool
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    md5_sign(params, secret) == sign
}
