use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use blockbus::logging::{LogEvent, LogSink};
use blockbus::{
    BlockHost, ChannelBus, Document, HostConfig, HostEvent, Logger, LoggingResult, Message,
    MessageTag, RegionSpec, Result, Size,
};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

#[derive(Clone, Default)]
struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _event: &LogEvent) -> LoggingResult<()> {
        Ok(())
    }
}

const FEED_DECLARATION: &str = r#"{
    "paste": {"channel": "feed"},
    "paginator": {"channel1": "feed", "channelnext": "nextpage"}
}"#;

const PAGE: &str = r#"<article>item</article>
    <div class="paste__delete paste__delete_hide paginator__page">
        <input type="hidden" name="page" value="2">
    </div>"#;

fn bus_fan_out(c: &mut Criterion) {
    let bus = Arc::new(ChannelBus::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let _subscriptions: Vec<_> = (0..32)
        .map(|_| {
            let hits = Arc::clone(&hits);
            bus.subscribe("feed", MessageTag::Wait, move |_, _| {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        })
        .collect();

    c.bench_function("bus_fan_out_32", |b| {
        b.iter(|| {
            let report = bus.emit(black_box("feed"), &Message::Wait);
            black_box(report.is_clean());
        });
    });
}

fn feed_insert_cycle(c: &mut Criterion) {
    let script = feed_events();
    c.bench_function("feed_insert_cycle", |b| {
        b.iter(|| {
            let mut host = build_host().expect("host");
            host.run_scripted(black_box(script.clone())).expect("scripted run");
            for _ in 0..8 {
                host.emit("feed", &Message::Wait).expect("wait");
                host.publish("feed", "insert", Some(PAGE)).expect("insert");
            }
        });
    });
}

fn build_host() -> Result<BlockHost> {
    let mut doc = Document::new(Size::new(1280, 800));
    doc.append(None, RegionSpec::new("feed").declare(FEED_DECLARATION))?;
    doc.append(
        Some("feed"),
        RegionSpec::new("spinner").classes("paste__trubber paste__trubber_hide paginator__trubber"),
    )?;
    doc.append(
        Some("feed"),
        RegionSpec::new("more").classes("paste__other paste__other_hide paginator__object"),
    )?;
    doc.append(
        Some("feed"),
        RegionSpec::new("slot")
            .classes("paste__delete paste__delete_hide paginator__page")
            .field("page", "1"),
    )?;

    let mut config = HostConfig::default();
    config.logger = Some(Logger::new(NullSink));
    config.enable_metrics();
    let mut host = BlockHost::with_config(doc, config);
    host.mount()?;
    Ok(host)
}

fn feed_events() -> Vec<HostEvent> {
    vec![
        HostEvent::Ready,
        HostEvent::Click {
            target: "more".to_string(),
        },
        HostEvent::Resize(Size::new(1024, 768)),
    ]
}

criterion_group!(benches, bus_fan_out, feed_insert_cycle);
criterion_main!(benches);
