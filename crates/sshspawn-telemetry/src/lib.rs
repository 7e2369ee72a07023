//! OpenTelemetry integration for sshspawn.
//!
//! Provides the OTel tracing layer, a sampler tuned for the spawner's span
//! mix (rare starts, very frequent polls), and W3C `traceparent` export so a
//! launched remote process can attach its own spans to the start trace.
//!
//! # Activation
//!
//! OTel export activates when standard OTel environment variables are set:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 sshspawn poll amy
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to explicitly disable even when the endpoint is set.
//! Without the `telemetry` feature every entry point is a no-op.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{otel_layer, OtelGuard};

fn env_is(name: &str, value: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v.eq_ignore_ascii_case(value))
}

/// Whether to install the OTel layer.
///
/// Needs the `telemetry` feature, `OTEL_SDK_DISABLED` not `true`, and either
/// an OTLP endpoint or an `OTEL_TRACES_EXPORTER` other than `none`.
pub fn otel_enabled() -> bool {
    if !cfg!(feature = "telemetry") || env_is("OTEL_SDK_DISABLED", "true") {
        return false;
    }
    let exporter_named =
        std::env::var("OTEL_TRACES_EXPORTER").is_ok() && !env_is("OTEL_TRACES_EXPORTER", "none");
    std::env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() || exporter_named
}

/// W3C `traceparent` of the current span, if there is a sampled OTel context.
///
/// Exported into the remote environment as `TRACEPARENT` at launch time.
pub fn current_traceparent() -> Option<String> {
    #[cfg(feature = "telemetry")]
    {
        otel::current_traceparent_impl()
    }
    #[cfg(not(feature = "telemetry"))]
    {
        None
    }
}

/// Sampling rate applied to a span name when no sampled parent exists.
///
/// Starts and stops are kept whole; polls fire once per user per interval
/// and are thinned to 5%. Everything else, `ssh.exec` included, gets 10%.
pub fn sample_rate(name: &str) -> f64 {
    match name {
        "spawner.start" | "spawner.stop" => 1.0,
        "spawner.poll" => 0.05,
        _ => 0.1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_by_prefix() {
        assert_eq!(sample_rate("spawner.start"), 1.0);
        assert_eq!(sample_rate("spawner.stop"), 1.0);
        assert_eq!(sample_rate("spawner.poll"), 0.05);
        assert_eq!(sample_rate("ssh.exec"), 0.1);
        assert_eq!(sample_rate("negotiate"), 0.1);
    }

    #[cfg(not(feature = "telemetry"))]
    #[test]
    fn test_disabled_without_feature() {
        assert!(!otel_enabled());
        assert!(current_traceparent().is_none());
    }
}
