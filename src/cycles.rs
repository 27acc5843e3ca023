//! Raw timestamp counter access with lazy frequency calibration.
//!
//! Producers stamp records and account blocked time in cycles because a
//! counter read is an order of magnitude cheaper than a clock syscall. The
//! conversion to seconds only happens when stats are formatted.

use std::sync::OnceLock;
use std::time::Instant;

/// Reads the highest-resolution monotonic counter the architecture offers.
#[inline(always)]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        let value: u64;
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) value);
        value
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Counter ticks per second, measured once over a short spin.
pub fn cycles_per_second() -> f64 {
    static HZ: OnceLock<f64> = OnceLock::new();
    *HZ.get_or_init(|| {
        let wall_start = Instant::now();
        let tsc_start = rdtsc();
        while wall_start.elapsed().as_millis() < 10 {
            std::hint::spin_loop();
        }
        let ticks = rdtsc().wrapping_sub(tsc_start);
        ticks as f64 / wall_start.elapsed().as_secs_f64()
    })
}

pub fn to_seconds(cycles: u64) -> f64 {
    cycles as f64 / cycles_per_second()
}

pub fn to_nanoseconds(cycles: u64) -> u64 {
    (to_seconds(cycles) * 1e9) as u64
}

/// Cycles in 10 ns, used to bucket producer blocked time.
#[cfg(feature = "producer-stats")]
pub fn cycles_in_10ns() -> u64 {
    ((cycles_per_second() / 1e8) as u64).max(1)
}
