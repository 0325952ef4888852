//! Conflict naming for keep-both resolution
//!
//! Two kinds of conflict copies exist:
//! - version conflicts keep the losing cloud version as `<stem>_1.<ext>`
//!   (then `_2`, `_3`, ... if taken)
//! - initial synchronization conflicts keep the local file as
//!   `<stem>_<device>.<ext>` (then `<stem>_<device>_2.<ext>`, ...)

use std::ffi::CStr;

use uuid::Uuid;

/// Highest numeric suffix tried before falling back to a UUID
const MAX_SUFFIX: u32 = 999;

/// Device name used when the hostname cannot be determined
pub const FALLBACK_DEVICE_NAME: &str = "device";

/// Generates unique names for conflict copies
pub struct ConflictNamer;

impl ConflictNamer {
    /// Splits a file name into stem and extension (extension without the dot)
    fn split(file_name: &str) -> (&str, Option<&str>) {
        match file_name.rfind('.') {
            Some(0) | None => (file_name, None),
            Some(dot_pos) => (&file_name[..dot_pos], Some(&file_name[dot_pos + 1..])),
        }
    }

    fn join(stem: &str, suffix: &str, extension: Option<&str>) -> String {
        match extension {
            Some(ext) => format!("{stem}_{suffix}.{ext}"),
            None => format!("{stem}_{suffix}"),
        }
    }

    /// Name for the copy of a diverging cloud version
    ///
    /// Given "Trip.kml", produces "Trip_1.kml", or "Trip_2.kml" if
    /// "Trip_1.kml" is taken.
    pub fn version_copy_name<F>(original_name: &str, mut exists: F) -> String
    where
        F: FnMut(&str) -> bool,
    {
        let (stem, extension) = Self::split(original_name);
        for i in 1..=MAX_SUFFIX {
            let candidate = Self::join(stem, &i.to_string(), extension);
            if !exists(&candidate) {
                return candidate;
            }
        }
        Self::join(stem, &Uuid::new_v4().simple().to_string(), extension)
    }

    /// Name for the local copy kept on an initial synchronization conflict
    ///
    /// Given "Trip.kml" and device "laptop", produces "Trip_laptop.kml",
    /// or "Trip_laptop_2.kml" if that is taken.
    pub fn device_copy_name<F>(original_name: &str, device_name: &str, mut exists: F) -> String
    where
        F: FnMut(&str) -> bool,
    {
        let (stem, extension) = Self::split(original_name);
        let device = sanitize_device_name(device_name);

        let candidate = Self::join(stem, &device, extension);
        if !exists(&candidate) {
            return candidate;
        }

        for i in 2..=MAX_SUFFIX {
            let numbered = Self::join(stem, &format!("{device}_{i}"), extension);
            if !exists(&numbered) {
                return numbered;
            }
        }
        Self::join(stem, &format!("{device}_{}", Uuid::new_v4().simple()), extension)
    }
}

/// Makes a device name safe for use inside a file name
fn sanitize_device_name(device_name: &str) -> String {
    let cleaned: String = device_name
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\0' || c.is_control() { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        FALLBACK_DEVICE_NAME.to_string()
    } else {
        cleaned
    }
}

/// Returns this machine's hostname, or [`FALLBACK_DEVICE_NAME`]
pub fn device_name() -> String {
    let mut buffer = [0u8; 256];
    // SAFETY: the buffer is valid for its full length and gethostname
    // writes at most that many bytes
    let result = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
    if result != 0 {
        return FALLBACK_DEVICE_NAME.to_string();
    }

    // Truncated hostnames are not guaranteed to be NUL terminated
    buffer[buffer.len() - 1] = 0;
    match CStr::from_bytes_until_nul(&buffer) {
        Ok(name) => sanitize_device_name(&name.to_string_lossy()),
        Err(_) => FALLBACK_DEVICE_NAME.to_string(),
    }
}
