//! FFmpeg FFI helpers: error translation, C string conversion, and a guard
//! that silences libav logging while hardware is being probed.

use std::ffi::{c_int, CStr, CString};
use std::fmt::{Display, Formatter};

use cutline_common::error::CutlineError;
use ffmpeg_sys_next as ffi;

/// Structured FFmpeg error details for module-specific wrapping.
#[derive(Debug, Clone)]
pub struct FfmpegErrorDetail {
    /// The libav call that failed (e.g. `"avformat_open_input"`).
    pub context: String,
    /// Raw FFmpeg error code (negative AVERROR value).
    pub code: i32,
    /// Message from `av_strerror`.
    pub message: String,
}

impl Display for FfmpegErrorDetail {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (code {})", self.context, self.message, self.code)
    }
}

impl FfmpegErrorDetail {
    pub fn into_decode(self) -> CutlineError {
        CutlineError::decode(self.to_string())
    }

    pub fn into_encode(self) -> CutlineError {
        CutlineError::encode(self.to_string())
    }

    pub fn into_container(self) -> CutlineError {
        CutlineError::container(self.to_string())
    }

    pub fn into_hardware(self) -> CutlineError {
        CutlineError::hardware(self.to_string())
    }
}

/// Human-readable message for an AVERROR code.
pub fn av_error_string(code: c_int) -> String {
    let mut buf = [0 as std::ffi::c_char; 256];
    // SAFETY: buf is a valid mutable buffer of known length.
    unsafe {
        ffi::av_strerror(code, buf.as_mut_ptr(), buf.len());
    }
    // SAFETY: av_strerror always NUL-terminates within the buffer.
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Translate an FFmpeg return code into a structured error.
pub fn check_ffmpeg(ret: c_int, context: &str) -> Result<(), FfmpegErrorDetail> {
    if ret >= 0 {
        return Ok(());
    }
    Err(FfmpegErrorDetail {
        context: context.to_string(),
        code: ret,
        message: av_error_string(ret),
    })
}

/// `AVERROR(EAGAIN)`.
pub fn averror_again() -> c_int {
    ffi::AVERROR(libc::EAGAIN)
}

/// `AVERROR_EOF`.
pub fn averror_eof() -> c_int {
    ffi::AVERROR_EOF
}

/// Convert a Rust `&str` to a `CString`, mapping NUL bytes to an error.
pub fn to_cstring(s: &str) -> Result<CString, CutlineError> {
    CString::new(s).map_err(|e| CutlineError::config(format!("Invalid C string {s:?}: {e}")))
}

/// Serializes tests that touch the global libav log level.
#[cfg(test)]
pub(crate) static LOG_LEVEL_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Lowers the libav log level for its lifetime and restores it on drop.
pub struct QuietLogGuard {
    previous: c_int,
}

impl QuietLogGuard {
    pub fn new() -> Self {
        // SAFETY: av_log_{get,set}_level only touch a global integer.
        let previous = unsafe { ffi::av_log_get_level() };
        unsafe { ffi::av_log_set_level(ffi::AV_LOG_QUIET as c_int) };
        Self { previous }
    }
}

impl Default for QuietLogGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for QuietLogGuard {
    fn drop(&mut self) {
        // SAFETY: see `new`.
        unsafe { ffi::av_log_set_level(self.previous) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes_pass() {
        assert!(check_ffmpeg(0, "noop").is_ok());
        assert!(check_ffmpeg(5, "noop").is_ok());
    }

    #[test]
    fn failures_carry_context_and_code() {
        let err = check_ffmpeg(averror_eof(), "av_read_frame").unwrap_err();
        assert_eq!(err.code, averror_eof());
        assert!(err.to_string().starts_with("av_read_frame: "));
    }

    #[test]
    fn quiet_guard_restores_level() {
        let _lock = LOG_LEVEL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let before = unsafe { ffi::av_log_get_level() };
        {
            let _guard = QuietLogGuard::new();
            assert_eq!(unsafe { ffi::av_log_get_level() }, ffi::AV_LOG_QUIET as c_int);
        }
        assert_eq!(unsafe { ffi::av_log_get_level() }, before);
    }
}
