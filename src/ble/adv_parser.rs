//! Advertising-data helpers used while scanning for roster peripherals.

use heapless::String;

use crate::config::BLE_NAME_MAX_LEN;

/// AD type: Shortened Local Name.
const AD_TYPE_NAME_SHORT: u8 = 0x08;
/// AD type: Complete Local Name.
const AD_TYPE_NAME_COMPLETE: u8 = 0x09;

/// Iterate `(ad_type, payload)` pairs, stopping at the first malformed entry.
fn ad_structures(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut i = 0;
    core::iter::from_fn(move || {
        let len = *data.get(i)? as usize;
        if len == 0 || i + len >= data.len() {
            return None;
        }
        let ad_type = data[i + 1];
        let payload = &data[i + 2..i + 1 + len];
        i += len + 1;
        Some((ad_type, payload))
    })
}

/// Extract the advertised local name.
///
/// A complete name wins over a shortened one. Names longer than
/// [`BLE_NAME_MAX_LEN`] bytes or that are not valid UTF-8 are rejected
/// rather than truncated, since they could never match a roster entry.
pub fn extract_device_name(data: &[u8]) -> Option<String<BLE_NAME_MAX_LEN>> {
    let mut shortened = None;
    for (ad_type, payload) in ad_structures(data) {
        match ad_type {
            AD_TYPE_NAME_COMPLETE => return to_name(payload),
            AD_TYPE_NAME_SHORT if shortened.is_none() => shortened = to_name(payload),
            _ => {}
        }
    }
    shortened
}

fn to_name(bytes: &[u8]) -> Option<String<BLE_NAME_MAX_LEN>> {
    let s = core::str::from_utf8(bytes).ok()?;
    let mut name = String::new();
    name.push_str(s).ok()?;
    Some(name)
}
