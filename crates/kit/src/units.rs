//! libvirt scaled-integer units.

/// Bytes in one KiB.
pub const KIB: u64 = 1024;
/// Bytes in one MiB.
pub const MIB: u64 = 1024 * KIB;
/// Bytes in one GiB.
pub const GIB: u64 = 1024 * MIB;

/// Multiplier for a libvirt unit suffix. A missing unit means bytes for
/// storage elements; callers that default to KiB (domain memory) pass "KiB".
pub fn unit_multiplier(unit: &str) -> Option<u64> {
    let m = match unit {
        "" | "b" | "B" | "bytes" => 1,
        "KB" => 1000,
        "k" | "K" | "KiB" => KIB,
        "MB" => 1000 * 1000,
        "m" | "M" | "MiB" => MIB,
        "GB" => 1000 * 1000 * 1000,
        "g" | "G" | "GiB" => GIB,
        "TB" => 1000 * 1000 * 1000 * 1000,
        "t" | "T" | "TiB" => 1024 * GIB,
        _ => return None,
    };
    Some(m)
}

/// Convert a libvirt `<capacity unit='…'>N</capacity>` style value to bytes.
pub fn to_bytes(value: &str, unit: &str) -> Option<u64> {
    let value: u64 = value.trim().parse().ok()?;
    value.checked_mul(unit_multiplier(unit)?)
}

/// Whole gigabytes to bytes.
pub fn gib(n: u64) -> u64 {
    n.saturating_mul(GIB)
}
