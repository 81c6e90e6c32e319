#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// Invalid CLI flags (bad addresses, invalid durations, etc.).
    InvalidInput = 30,

    /// Internal/runtime error (IO errors, failed binds, unexpected
    /// invariants).
    RuntimeError = 40,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}
