// Telemetry shims: with the `telemetry` feature the macros expand to the
// real `metrics` recorders; without it they expand to noop handles so call
// sites stay identical and cost nothing.

#[cfg(feature = "telemetry")]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        metrics::counter!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        $crate::telemetry::NoopCounter
    };
}

#[cfg(feature = "telemetry")]
macro_rules! t_gauge {
    ($($tt:tt)*) => {
        metrics::gauge!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
macro_rules! t_gauge {
    ($($tt:tt)*) => {
        $crate::telemetry::NoopGauge
    };
}

pub(crate) use t_counter;
pub(crate) use t_gauge;

#[cfg(not(feature = "telemetry"))]
#[derive(Copy, Clone)]
pub(crate) struct NoopCounter;

#[cfg(not(feature = "telemetry"))]
impl NoopCounter {
    pub(crate) fn increment(&self, _value: u64) {}
}

#[cfg(not(feature = "telemetry"))]
#[derive(Copy, Clone)]
pub(crate) struct NoopGauge;

#[cfg(not(feature = "telemetry"))]
#[allow(dead_code)]
impl NoopGauge {
    pub(crate) fn set(&self, _value: f64) {}
}
