//! Timestamp conversions shared by the decoders.

/// Milliseconds since the epoch from a header's unix seconds/nanoseconds.
pub(crate) fn unix_ms(secs: u32, nsecs: u32) -> u64 {
    u64::from(secs) * 1000 + u64::from(nsecs) / 1_000_000
}

/// Converts sys-uptime-relative flow timestamps to epoch milliseconds,
/// handling 32-bit uptime wraps.
///
/// `boot_ms` is the exporter's boot time in epoch milliseconds. A start later
/// than the end means the uptime counter wrapped between the two; an end
/// beyond the header's sys-uptime means the counter wrapped after the flow
/// ended but before it was exported, shifting both ends back one epoch.
pub(crate) fn uptime_to_msec(first: u32, last: u32, sys_uptime: u32, boot_ms: u64) -> (u64, u64) {
    const WRAP: u64 = 0x1_0000_0000;

    let first = u64::from(first);
    let last = u64::from(last);

    let mut msec_start = if first > last {
        boot_ms.saturating_add(first).saturating_sub(WRAP)
    } else {
        boot_ms.saturating_add(first)
    };
    let mut msec_end = boot_ms.saturating_add(last);

    if last > u64::from(sys_uptime) {
        msec_start = msec_start.saturating_sub(WRAP);
        msec_end = msec_end.saturating_sub(WRAP);
    }

    (msec_start, msec_end)
}
