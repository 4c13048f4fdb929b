use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, as used by the rate meters and the
/// warmup lease. Wall-clock time, not monotonic.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct CounterGuard<'a, F>
where
    F: Fn(&str, i64),
{
    label: &'a str,
    func: F,
}

impl<'a, F> CounterGuard<'a, F>
where
    F: Fn(&str, i64),
{
    pub fn new(label: &'a str, func: F) -> Self {
        func(label, 1);
        Self { label, func }
    }
}

impl<F> Drop for CounterGuard<'_, F>
where
    F: Fn(&str, i64),
{
    fn drop(&mut self) {
        (self.func)(self.label, -1);
    }
}
