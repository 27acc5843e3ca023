//! Staged record layout and the producer-facing serialization surface.
//!
//! A staged record is a fixed header followed by the serialized arguments.
//! Nothing here formats text: arguments go into the staging ring as raw
//! bytes and stay binary all the way to disk.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::runtime::registry::ParamKind;

/// Fixed header preceding every record in a staging ring.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
#[repr(C)]
pub struct RecordHeader {
    pub site_id: u32,
    pub payload_len: u32,
    pub timestamp: u64,
}

impl RecordHeader {
    pub const SIZE: usize = core::mem::size_of::<RecordHeader>();
}

const _: () = {
    assert!(RecordHeader::SIZE == 16);
};

/// Serialization of one log argument into a staged payload.
///
/// Integers widen to 8 bytes, strings carry a 16-bit length prefix. The
/// schema side of each impl is `kind()`, captured into the call-site
/// dictionary at first execution.
pub trait LogArg {
    fn kind(&self) -> ParamKind;
    fn size(&self) -> usize;
    /// Writes exactly `self.size()` bytes into `out` and returns that count.
    fn write(&self, out: &mut [u8]) -> usize;
}

macro_rules! impl_signed {
    ($($t:ty),*) => {$(
        impl LogArg for $t {
            fn kind(&self) -> ParamKind { ParamKind::Signed }
            fn size(&self) -> usize { 8 }
            fn write(&self, out: &mut [u8]) -> usize {
                out[..8].copy_from_slice(&(*self as i64).to_le_bytes());
                8
            }
        }
    )*};
}

macro_rules! impl_unsigned {
    ($($t:ty),*) => {$(
        impl LogArg for $t {
            fn kind(&self) -> ParamKind { ParamKind::Unsigned }
            fn size(&self) -> usize { 8 }
            fn write(&self, out: &mut [u8]) -> usize {
                out[..8].copy_from_slice(&(*self as u64).to_le_bytes());
                8
            }
        }
    )*};
}

impl_signed!(i8, i16, i32, i64, isize);
impl_unsigned!(u8, u16, u32, u64, usize);

impl LogArg for f64 {
    fn kind(&self) -> ParamKind {
        ParamKind::Float
    }
    fn size(&self) -> usize {
        8
    }
    fn write(&self, out: &mut [u8]) -> usize {
        out[..8].copy_from_slice(&self.to_le_bytes());
        8
    }
}

impl LogArg for f32 {
    fn kind(&self) -> ParamKind {
        ParamKind::Float
    }
    fn size(&self) -> usize {
        8
    }
    fn write(&self, out: &mut [u8]) -> usize {
        (f64::from(*self)).write(out)
    }
}

impl LogArg for bool {
    fn kind(&self) -> ParamKind {
        ParamKind::Bool
    }
    fn size(&self) -> usize {
        1
    }
    fn write(&self, out: &mut [u8]) -> usize {
        out[0] = u8::from(*self);
        1
    }
}

/// Strings longer than `u16::MAX` are truncated at the prefix boundary.
impl LogArg for &str {
    fn kind(&self) -> ParamKind {
        ParamKind::Str
    }
    fn size(&self) -> usize {
        2 + self.len().min(u16::MAX as usize)
    }
    fn write(&self, out: &mut [u8]) -> usize {
        let len = self.len().min(u16::MAX as usize);
        out[..2].copy_from_slice(&(len as u16).to_le_bytes());
        out[2..2 + len].copy_from_slice(&self.as_bytes()[..len]);
        2 + len
    }
}

impl LogArg for String {
    fn kind(&self) -> ParamKind {
        ParamKind::Str
    }
    fn size(&self) -> usize {
        self.as_str().size()
    }
    fn write(&self, out: &mut [u8]) -> usize {
        self.as_str().write(out)
    }
}

/// Records a log event at the given severity.
///
/// The level check happens before anything else; a filtered-out site costs a
/// load and a compare. On the first admitted execution the site registers
/// itself and caches its id.
///
/// ```ignore
/// log_event!(Notice, "accepted connection {} after {} ms", conn_id, elapsed);
/// ```
#[macro_export]
macro_rules! log_event {
    ($level:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        static SITE: $crate::CallSite = $crate::CallSite::new(
            $crate::LogLevel::$level,
            file!(),
            line!(),
            $fmt,
        );
        static SITE_ID: ::core::sync::atomic::AtomicU32 =
            ::core::sync::atomic::AtomicU32::new($crate::runtime::UNREGISTERED_ID);
        if ($crate::LogLevel::$level as u8) <= ($crate::log_level() as u8) {
            $crate::runtime::log_site(&SITE, &SITE_ID, &[$(&$arg as &dyn $crate::LogArg),*]);
        }
    }};
}
