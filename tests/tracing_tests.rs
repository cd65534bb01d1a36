//! Integration tests for span emission through a recording tracer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use segment_engine::{
    AnySchema, AttributeValue, EngineOptions, MatcherConfigs, NoopLogger, SegmentEngine,
    SpanContext, SpanStatus, StatusCode, TraceSpan, Tracer,
};
use serde_json::json;

#[derive(Debug, Clone)]
struct Recorded {
    name: String,
    id: u64,
    parent: Option<u64>,
    attributes: Vec<(String, AttributeValue)>,
    status: Option<SpanStatus>,
    ends: usize,
}

impl Recorded {
    fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

#[derive(Default)]
struct RecordingTracer {
    next_id: AtomicU64,
    spans: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingTracer {
    fn spans(&self) -> Vec<Recorded> {
        self.spans.lock().clone()
    }

    fn named(&self, name: &str) -> Vec<Recorded> {
        self.spans().into_iter().filter(|s| s.name == name).collect()
    }
}

struct RecordingSpan {
    index: usize,
    name: String,
    id: u64,
    spans: Arc<Mutex<Vec<Recorded>>>,
}

impl Tracer for RecordingTracer {
    fn start_span(&self, name: &str, parent: Option<&SpanContext>) -> Box<dyn TraceSpan> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut spans = self.spans.lock();
        spans.push(Recorded {
            name: name.to_string(),
            id,
            parent: parent.map(SpanContext::id).filter(|id| *id != 0),
            attributes: Vec::new(),
            status: None,
            ends: 0,
        });
        Box::new(RecordingSpan {
            index: spans.len() - 1,
            name: name.to_string(),
            id,
            spans: self.spans.clone(),
        })
    }
}

impl TraceSpan for RecordingSpan {
    fn set_attribute(&mut self, key: &str, value: AttributeValue) {
        self.spans.lock()[self.index]
            .attributes
            .push((key.to_string(), value));
    }

    fn set_status(&mut self, status: SpanStatus) {
        self.spans.lock()[self.index].status = Some(status);
    }

    fn end(&mut self) {
        self.spans.lock()[self.index].ends += 1;
    }

    fn context(&self) -> SpanContext {
        SpanContext::new(self.name.clone(), self.id)
    }
}

fn engine(tracer: Arc<RecordingTracer>) -> SegmentEngine {
    SegmentEngine::builder(AnySchema)
        .options(
            EngineOptions::new()
                .with_logger(NoopLogger)
                .with_tracer(tracer),
        )
        .matchers(|m| {
            let mut matchers = MatcherConfigs::new();
            matchers.insert(
                "isAdmin".into(),
                m.define()
                    .evaluate_sync(|input| Ok(input.subject["role"] == "admin"))
                    .build()?,
            );
            matchers.insert(
                "hasRole".into(),
                m.define()
                    .args(AnySchema)
                    .evaluate_sync(|input| {
                        Ok(Some(&input.subject["role"]) == input.args.as_ref())
                    })
                    .build()?,
            );
            matchers.insert(
                "broken".into(),
                m.define()
                    .evaluate_sync(|_| Err("lookup failed".into()))
                    .build()?,
            );
            Ok(matchers)
        })
        .segment("editors", |s| {
            Ok(s.ops.and([
                s.ops.not(s.matcher("isAdmin")?),
                s.matcher_with("hasRole", json!("editor"))?,
                // Served from the per-call cache: no second span.
                s.matcher("isAdmin").map(|admin| s.ops.not(admin))?,
            ]))
        })
        .segment("broken", |s| s.matcher("broken"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_segment_and_matcher_spans() {
    let tracer = Arc::new(RecordingTracer::default());
    let engine = engine(tracer.clone());
    let ctx = engine.context_for(&json!({"role": "editor"})).await.unwrap();

    assert!(ctx.matches("editors").await);

    let spans = tracer.spans();
    assert_eq!(spans.len(), 3, "spans: {:?}", spans);

    let segment = &tracer.named("segment:editors")[0];
    assert_eq!(segment.parent, None);
    assert_eq!(
        segment.attribute("segment.name"),
        Some(&AttributeValue::from("editors"))
    );
    assert_eq!(
        segment.attribute("segment.result"),
        Some(&AttributeValue::Bool(true))
    );
    assert_eq!(segment.status.as_ref().map(|s| s.code), Some(StatusCode::Ok));

    let is_admin = &tracer.named("matcher:isAdmin")[0];
    assert_eq!(is_admin.parent, Some(segment.id));
    assert_eq!(
        is_admin.attribute("matcher.result"),
        Some(&AttributeValue::Bool(false))
    );

    let has_role = &tracer.named("matcher:hasRole")[0];
    assert_eq!(has_role.parent, Some(segment.id));
    assert_eq!(
        has_role.attribute("matcher.args"),
        Some(&AttributeValue::from(r#""editor""#))
    );

    for span in &spans {
        assert_eq!(span.ends, 1, "span {} ended {} times", span.name, span.ends);
    }
}

#[tokio::test]
async fn test_errors_are_recorded_on_spans() {
    let tracer = Arc::new(RecordingTracer::default());
    let engine = engine(tracer.clone());
    let ctx = engine.context_for(&json!({"role": "editor"})).await.unwrap();

    assert!(!ctx.matches("broken").await);

    let matcher = &tracer.named("matcher:broken")[0];
    assert_eq!(
        matcher.attribute("error.kind"),
        Some(&AttributeValue::from("MatcherEvaluationError"))
    );
    assert_eq!(
        matcher.status.as_ref().map(|s| s.code),
        Some(StatusCode::Error)
    );

    let segment = &tracer.named("segment:broken")[0];
    assert_eq!(
        segment.attribute("segment.result"),
        Some(&AttributeValue::Bool(false))
    );
    match segment.attribute("error.stack") {
        Some(AttributeValue::String(stack)) => assert!(stack.contains("lookup failed")),
        other => panic!("missing error.stack: {:?}", other),
    }
    assert!(tracer.spans().iter().all(|s| s.ends == 1));
}

#[tokio::test]
async fn test_unknown_and_ad_hoc_segments_get_spans() {
    let tracer = Arc::new(RecordingTracer::default());
    let engine = engine(tracer.clone());
    let ctx = engine.context_for(&json!({"role": "admin"})).await.unwrap();

    assert!(!ctx.matches("missing").await);
    assert!(
        ctx.matches(segment_engine::SegmentRef::ad_hoc(|s| s.matcher("isAdmin")))
            .await
    );

    let missing = &tracer.named("segment:missing")[0];
    assert_eq!(
        missing.attribute("error.kind"),
        Some(&AttributeValue::from("StructuralError"))
    );
    let ad_hoc = &tracer.named("segment:ad-hoc")[0];
    assert_eq!(tracer.named("matcher:isAdmin")[0].parent, Some(ad_hoc.id));
}

#[tokio::test]
async fn test_builtin_tracer_without_subscriber() {
    let engine = SegmentEngine::builder(AnySchema)
        .options(EngineOptions::new().with_tracer(true))
        .matchers(|m| {
            let mut matchers = MatcherConfigs::new();
            matchers.insert("always".into(), m.define().evaluate_sync(|_| Ok(true)).build()?);
            Ok(matchers)
        })
        .segment("everyone", |s| s.matcher("always"))
        .build()
        .unwrap();

    let ctx = engine.context_for(&json!({})).await.unwrap();
    assert!(ctx.matches("everyone").await);
}
