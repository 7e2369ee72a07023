//! Exporter wiring, traceparent injection, and the activity sampler.

use std::collections::HashMap;

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, Value};
use opentelemetry_otlp::{ExporterBuildError, SpanExporter};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider, ShouldSample};
use opentelemetry_sdk::Resource;
use tracing_opentelemetry::{OpenTelemetryLayer, OpenTelemetrySpanExt};

use crate::sample_rate;

/// Keeps the tracer provider alive. Dropping it flushes and shuts down export.
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("sshspawn: flushing spans failed: {e}");
        }
    }
}

/// OTLP (gRPC) layer for a `tracing` registry.
///
/// Needs a running Tokio runtime: the batch processor spawns onto it.
pub fn otel_layer<S>(
    service_name: &str,
) -> Result<(OpenTelemetryLayer<S, SdkTracer>, OtelGuard), ExporterBuildError>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(SpanExporter::builder().with_tonic().build()?)
        .with_sampler(Sampler::ParentBased(Box::new(ActivitySampler)))
        .with_resource(Resource::builder().with_service_name(service_name.to_owned()).build())
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());
    let layer = OpenTelemetryLayer::new(provider.tracer("sshspawn"));
    Ok((layer, OtelGuard { provider }))
}

pub(crate) fn current_traceparent_impl() -> Option<String> {
    let cx = tracing::Span::current().context();
    if !cx.span().span_context().is_valid() {
        return None;
    }

    let mut headers: HashMap<String, String> = HashMap::new();
    TraceContextPropagator::new().inject_context(&cx, &mut headers);
    headers.remove("traceparent").filter(|v| !v.is_empty())
}

/// Root sampler keyed on span name. Child spans follow their parent via
/// `Sampler::ParentBased`.
#[derive(Debug, Clone)]
struct ActivitySampler;

fn is_failure(attributes: &[KeyValue]) -> bool {
    attributes.iter().any(|kv| match (kv.key.as_str(), &kv.value) {
        ("otel.status_code", Value::String(s)) => s.as_str() == "ERROR",
        ("error", Value::Bool(b)) => *b,
        ("error", Value::String(s)) => s.as_str() == "true",
        _ => false,
    })
}

impl ShouldSample for ActivitySampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        if is_failure(attributes) {
            return SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: Vec::new(),
                trace_state: TraceState::default(),
            };
        }

        Sampler::TraceIdRatioBased(sample_rate(name)).should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        )
    }
}
