//! End-to-end publish/subscribe over localhost TCP

use std::time::{Duration, Instant};

use openfilter_core::endpoint::Ephemerality;
use openfilter_core::frame::{Frame, Image, PixelFormat};
use openfilter_transport::wire::{self, ControlMessage, WireMessage};
use openfilter_transport::{Consumer, ConsumerConfig, ConsumerEvent, Producer, ProducerConfig};

fn test_image() -> Image {
    Image::new(
        2,
        2,
        PixelFormat::Bgr,
        vec![
            0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xFF,
        ],
    )
    .unwrap()
}

fn frame_with_id(id: u64) -> Frame {
    let mut frame = Frame::new("main").with_image(test_image());
    frame.id = id;
    frame.src = "A".into();
    frame
}

async fn bind_producer(cfg: ProducerConfig) -> Producer {
    Producer::bind("127.0.0.1", 0, "A", "run-test", cfg)
        .await
        .unwrap()
}

async fn wait_for_consumers(producer: &Producer, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while producer.consumer_count() < n {
        assert!(Instant::now() < deadline, "consumer never connected");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// One-hop pub/sub: three frames arrive in order, bytes intact
#[tokio::test(flavor = "multi_thread")]
async fn test_one_hop_in_order() {
    let producer = bind_producer(ProducerConfig::default()).await;
    let addr = producer.local_addr();

    let mut consumer = Consumer::connect(
        addr.to_string(),
        ConsumerConfig {
            topics: vec!["main".into()],
            ..ConsumerConfig::default()
        },
    );
    match consumer.next_event().await.unwrap() {
        ConsumerEvent::Connected { producer_id, run_id, .. } => {
            assert_eq!(producer_id, "A");
            assert_eq!(run_id, "run-test");
        }
        other => panic!("expected Connected, got {other:?}"),
    }
    wait_for_consumers(&producer, 1).await;

    for id in [1, 2, 3] {
        producer.publish(frame_with_id(id)).await.unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 3 {
        match consumer.next_event().await.unwrap() {
            ConsumerEvent::Frame(frame) => {
                assert_eq!(frame.image.as_ref().unwrap().bytes(), test_image().bytes());
                seen.push(frame.id);
            }
            ConsumerEvent::Disconnected { reason } => panic!("disconnected: {reason}"),
            _ => {}
        }
    }
    assert_eq!(seen, vec![1, 2, 3]);
}

/// Topic filtering: a subscriber only sees its topics
#[tokio::test(flavor = "multi_thread")]
async fn test_topic_filtering() {
    let producer = bind_producer(ProducerConfig::default()).await;
    let mut consumer = Consumer::connect(
        producer.local_addr().to_string(),
        ConsumerConfig {
            topics: vec!["wanted".into()],
            ..ConsumerConfig::default()
        },
    );
    assert!(matches!(
        consumer.next_event().await.unwrap(),
        ConsumerEvent::Connected { .. }
    ));
    wait_for_consumers(&producer, 1).await;

    let mut unwanted = Frame::new("unwanted");
    unwanted.id = 1;
    producer.publish(unwanted).await.unwrap();
    let mut wanted = Frame::new("wanted");
    wanted.id = 2;
    producer.publish(wanted).await.unwrap();

    match consumer.next_event().await.unwrap() {
        ConsumerEvent::Frame(frame) => {
            assert_eq!(frame.topic, "wanted");
            assert_eq!(frame.id, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
}

/// A slow ephemeral consumer never throttles the producer
#[tokio::test(flavor = "multi_thread")]
async fn test_ephemeral_does_not_block() {
    let producer = bind_producer(ProducerConfig {
        outbox_depth: 1,
        ..ProducerConfig::default()
    })
    .await;
    let addr = producer.local_addr().to_string();

    // fast non-ephemeral consumer drains continuously
    let mut fast = Consumer::connect(addr.clone(), ConsumerConfig::default());
    assert!(matches!(
        fast.next_event().await.unwrap(),
        ConsumerEvent::Connected { .. }
    ));
    let fast_count = tokio::spawn(async move {
        let mut count = 0u64;
        while let Some(event) = fast.next_event().await {
            match event {
                ConsumerEvent::Frame(_) => count += 1,
                ConsumerEvent::Eos { .. } => break,
                _ => {}
            }
        }
        count
    });

    // slow ephemeral consumer: connects, then never reads
    let slow = Consumer::connect(
        addr,
        ConsumerConfig {
            ephemerality: Ephemerality::Ephemeral,
            queue_depth: 1,
            ..ConsumerConfig::default()
        },
    );
    wait_for_consumers(&producer, 2).await;

    const N: u64 = 500;
    let started = Instant::now();
    for id in 0..N {
        producer.publish(frame_with_id(id)).await.unwrap();
    }
    let publish_time = started.elapsed();
    producer.send_eos("main").await;
    producer.flush(Duration::from_secs(5)).await;

    let fast_seen = fast_count.await.unwrap();
    assert_eq!(fast_seen, N, "non-ephemeral consumer must see every frame");
    // the 1-deep ephemeral slot must not have stalled publishing; allow
    // generous slack for CI machines
    assert!(
        publish_time < Duration::from_secs(10),
        "publishing stalled: {publish_time:?}"
    );
    drop(slow);
}

/// A silent connection is served as doubly ephemeral and stays invisible
#[tokio::test(flavor = "multi_thread")]
async fn test_doubly_ephemeral_is_invisible() {
    let producer = bind_producer(ProducerConfig {
        subscribe_timeout: Duration::from_millis(100),
        ..ProducerConfig::default()
    })
    .await;
    let addr = producer.local_addr().to_string();

    let mut silent = Consumer::connect(
        addr,
        ConsumerConfig {
            ephemerality: Ephemerality::DoublyEphemeral,
            ..ConsumerConfig::default()
        },
    );
    assert!(matches!(
        silent.next_event().await.unwrap(),
        ConsumerEvent::Connected { .. }
    ));

    // give the producer time to classify the silent peer
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(producer.consumer_count(), 0, "silent peer must not be tracked");

    // it still receives whatever the socket layer delivers
    producer.publish(frame_with_id(9)).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "silent consumer got nothing");
        match silent.next_event().await.unwrap() {
            ConsumerEvent::Frame(frame) => {
                assert_eq!(frame.id, 9);
                break;
            }
            _ => continue,
        }
    }
}

/// EOS reaches subscribers of the topic
#[tokio::test(flavor = "multi_thread")]
async fn test_eos_delivery() {
    let producer = bind_producer(ProducerConfig::default()).await;
    let mut consumer = Consumer::connect(producer.local_addr().to_string(), ConsumerConfig::default());
    assert!(matches!(
        consumer.next_event().await.unwrap(),
        ConsumerEvent::Connected { .. }
    ));
    wait_for_consumers(&producer, 1).await;

    producer.publish(frame_with_id(1)).await.unwrap();
    producer.send_eos("main").await;

    let mut got_frame = false;
    loop {
        match consumer.next_event().await.unwrap() {
            ConsumerEvent::Frame(_) => got_frame = true,
            ConsumerEvent::Eos { topic } => {
                assert_eq!(topic, "main");
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(got_frame);
}

/// A consumer that never answers pings gets its slot evicted
#[tokio::test(flavor = "multi_thread")]
async fn test_missed_pongs_evict_slot() {
    let producer = bind_producer(ProducerConfig {
        heartbeat_interval: Duration::from_millis(20),
        max_missed_pongs: 3,
        ..ProducerConfig::default()
    })
    .await;
    let addr = producer.local_addr();

    // raw socket that subscribes but never replies to pings
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    match wire::read_message(&mut stream).await.unwrap() {
        WireMessage::Control(ControlMessage::Hello { .. }) => {}
        other => panic!("unexpected {other:?}"),
    }
    wire::write_control(
        &mut stream,
        &ControlMessage::Subscribe {
            topics: vec!["*".into()],
            ephemeral: false,
        },
    )
    .await
    .unwrap();
    wait_for_consumers(&producer, 1).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while producer.consumer_count() > 0 {
        assert!(Instant::now() < deadline, "dead consumer never evicted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A dropped producer triggers Disconnected; a fresh one is picked up
/// again by the reconnect loop on the same address
#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_after_producer_restart() {
    let producer = bind_producer(ProducerConfig::default()).await;
    let addr = producer.local_addr();

    let mut consumer = Consumer::connect(addr.to_string(), ConsumerConfig::default());
    assert!(matches!(
        consumer.next_event().await.unwrap(),
        ConsumerEvent::Connected { .. }
    ));
    wait_for_consumers(&producer, 1).await;

    producer.close();
    drop(producer);
    loop {
        match consumer.next_event().await.unwrap() {
            ConsumerEvent::Disconnected { .. } => break,
            _ => continue,
        }
    }

    // rebind on the same port and expect the consumer back
    let producer = Producer::bind(
        "127.0.0.1",
        addr.port(),
        "A",
        "run-test-2",
        ProducerConfig::default(),
    )
    .await
    .unwrap();
    loop {
        match consumer.next_event().await.unwrap() {
            ConsumerEvent::Connected { run_id, .. } => {
                assert_eq!(run_id, "run-test-2");
                break;
            }
            _ => continue,
        }
    }
    wait_for_consumers(&producer, 1).await;
}
