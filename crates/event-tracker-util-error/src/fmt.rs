use std::fmt;

/// Wraps an error so its `Display` prints only the top-level message,
/// dropping the `source()` chain — handy for single-line `tracing` fields.
pub struct FmtCompactError<'e>(&'e (dyn std::error::Error + 'static));

impl fmt::Display for FmtCompactError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> FmtCompactError<'_>;
}

impl<E> FmtCompact for E
where
    E: std::error::Error + 'static,
{
    fn fmt_compact(&self) -> FmtCompactError<'_> {
        FmtCompactError(self)
    }
}
