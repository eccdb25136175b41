//! One-hop pipeline: wire source → filter → wire sink

use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use openfilter_core::config;
use openfilter_core::frame::{Frame, Image, PixelFormat};
use openfilter_core::{Result, Run};
use openfilter_runtime::filter::{Filter, FilterContext, Tick};
use openfilter_runtime::plugins::PluginRegistry;
use openfilter_runtime::supervisor::{run_filter, WorkerControl};
use openfilter_transport::{Consumer, ConsumerConfig, ConsumerEvent, Producer, ProducerConfig};

/// Reserve an OS-assigned port for an endpoint configured by string
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn config_map(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

struct Tagger;

impl Filter for Tagger {
    fn process(&mut self, _ctx: &FilterContext, mut tick: Tick) -> Result<Vec<Frame>> {
        let mut out = Vec::new();
        if let Some(mut frame) = tick.take("main") {
            frame.meta.insert("seen".into(), Value::from(true));
            out.push(frame);
        }
        Ok(out)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_hop_through_a_filter() {
    let upstream = Producer::bind("127.0.0.1", 0, "Src", "run-pipe", ProducerConfig::default())
        .await
        .unwrap();
    let out_port = free_port();

    let cfg = config::normalize(
        "Tagger",
        config_map(json!({
            "sources": format!("tcp://127.0.0.1:{};main", upstream.local_addr().port()),
            "outputs": format!("tcp://127.0.0.1:{out_port};main"),
        })),
    )
    .unwrap();
    let (_stop, ctl) = WorkerControl::standalone();
    let worker = tokio::spawn(run_filter(
        Box::new(Tagger),
        cfg,
        Run::new("test"),
        PluginRegistry::new(),
        ctl,
    ));

    let mut downstream = Consumer::connect(
        format!("127.0.0.1:{out_port}"),
        ConsumerConfig::default(),
    );

    // wait for the filter to subscribe upstream
    let deadline = Instant::now() + Duration::from_secs(5);
    while upstream.consumer_count() < 1 {
        assert!(Instant::now() < deadline, "filter never connected upstream");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for id in 1..=3u64 {
        let mut frame = Frame::new("main").with_image(
            Image::new(2, 2, PixelFormat::Bgr, vec![7u8; 12]).unwrap(),
        );
        frame.id = id;
        frame.ts = openfilter_runtime::supervisor::now_ns();
        frame.src = "Src".into();
        frame.meta.insert("n".into(), Value::from(id));
        upstream.publish(frame).await.unwrap();
    }
    upstream.send_eos("main").await;

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.len() < 3 {
        assert!(Instant::now() < deadline, "frames never arrived downstream");
        match tokio::time::timeout(Duration::from_secs(5), downstream.next_event())
            .await
            .expect("event timeout")
            .expect("consumer closed")
        {
            ConsumerEvent::Frame(frame) => seen.push(frame),
            _ => continue,
        }
    }

    for (i, frame) in seen.iter().enumerate() {
        assert_eq!(frame.id, i as u64 + 1);
        assert_eq!(frame.topic, "main");
        assert_eq!(frame.meta.get("seen"), Some(&Value::from(true)));
        assert_eq!(frame.image.as_ref().unwrap().bytes(), &[7u8; 12]);
        let meta = frame.runtime_meta().unwrap();
        assert_eq!(meta.get("src"), Some(&Value::from("Tagger")));
        assert!(meta.contains_key("fps"));
        assert!(meta.contains_key("lat_in"));
        assert!(meta.contains_key("lat_out"));
    }

    // upstream EOS propagates: the filter drains and exits cleanly
    let report = tokio::time::timeout(Duration::from_secs(10), worker)
        .await
        .expect("filter never exited")
        .unwrap()
        .unwrap();
    assert!(report.error.is_none());
    assert_eq!(report.frames_in, 3);
    assert_eq!(report.frames_out, 3);

    // and downstream observes the end of the topic
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "no EOS downstream");
        match tokio::time::timeout(Duration::from_secs(5), downstream.next_event())
            .await
            .expect("event timeout")
            .expect("consumer closed")
        {
            ConsumerEvent::Eos { topic } => {
                assert_eq!(topic, "main");
                break;
            }
            _ => continue,
        }
    }
}

struct Renamer;

impl Filter for Renamer {
    fn process(&mut self, _ctx: &FilterContext, tick: Tick) -> Result<Vec<Frame>> {
        Ok(tick.into_frames().collect())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_topic_remap_in_and_out() {
    let upstream = Producer::bind("127.0.0.1", 0, "Src", "run-remap", ProducerConfig::default())
        .await
        .unwrap();
    let out_port = free_port();

    // consume `cam` as `main`, publish `main` back out as `annotated`
    let cfg = config::normalize(
        "Renamer",
        config_map(json!({
            "sources": format!("tcp://127.0.0.1:{};cam>main", upstream.local_addr().port()),
            "outputs": format!("tcp://127.0.0.1:{out_port};main>annotated"),
        })),
    )
    .unwrap();
    let (_stop, ctl) = WorkerControl::standalone();
    let worker = tokio::spawn(run_filter(
        Box::new(Renamer),
        cfg,
        Run::new("test"),
        PluginRegistry::new(),
        ctl,
    ));

    let mut downstream = Consumer::connect(
        format!("127.0.0.1:{out_port}"),
        ConsumerConfig::default(),
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while upstream.consumer_count() < 1 {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut frame = Frame::new("cam");
    frame.id = 1;
    upstream.publish(frame).await.unwrap();
    upstream.send_eos("cam").await;

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "remapped frame never arrived");
        match tokio::time::timeout(Duration::from_secs(5), downstream.next_event())
            .await
            .expect("event timeout")
            .expect("consumer closed")
        {
            ConsumerEvent::Frame(frame) => {
                assert_eq!(frame.topic, "annotated");
                break;
            }
            _ => continue,
        }
    }
    let report = tokio::time::timeout(Duration::from_secs(10), worker)
        .await
        .expect("filter never exited")
        .unwrap()
        .unwrap();
    assert!(report.error.is_none());
}
