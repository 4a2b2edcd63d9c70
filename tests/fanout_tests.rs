//! Fanout properties: replay atomicity, ordering, backpressure, eviction.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use termhub::fanout::Fanout;
use termhub::{Sink, SinkEvent};

#[derive(Clone, Default)]
struct Capture {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl Capture {
    fn new() -> Self {
        Self::default()
    }

    fn sink(&self) -> Sink {
        let events = Arc::clone(&self.events);
        Box::new(move |event| {
            events.lock().unwrap().push(event);
            Ok(())
        })
    }

    fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for event in self.events.lock().unwrap().iter() {
            if let SinkEvent::Bytes(chunk) = event {
                out.extend_from_slice(chunk);
            }
        }
        out
    }

    fn evicted(&self) -> Option<u64> {
        self.events.lock().unwrap().iter().find_map(|event| {
            if let SinkEvent::Evicted { dropped_bytes } = event {
                Some(*dropped_bytes)
            } else {
                None
            }
        })
    }

    fn exited(&self) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, SinkEvent::Exited { .. }))
    }
}

async fn wait_for<F: FnMut() -> bool>(mut cond: F, secs: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn replay_precedes_live_chunks() -> anyhow::Result<()> {
    let fanout = Fanout::new(1024, 16, 1024 * 1024);
    fanout.publish(b"early-");

    let capture = Capture::new();
    fanout.subscribe(capture.sink()).unwrap();
    fanout.publish(b"late");

    assert!(wait_for(|| capture.bytes() == b"early-late", 2).await);
    Ok(())
}

#[tokio::test]
async fn attach_neither_misses_nor_duplicates() -> anyhow::Result<()> {
    let fanout = Fanout::new(1024, 16, 1024 * 1024);
    fanout.publish(b"one");
    fanout.publish(b"two");

    let capture = Capture::new();
    fanout.subscribe(capture.sink()).unwrap();
    fanout.publish(b"three");
    fanout.publish(b"four");

    assert!(wait_for(|| capture.bytes() == b"onetwothreefour", 2).await);
    Ok(())
}

#[tokio::test]
async fn replay_respects_scrollback_cap() -> anyhow::Result<()> {
    let fanout = Fanout::new(8, 16, 1024 * 1024);
    fanout.publish(b"aaaa");
    fanout.publish(b"bbbb");
    fanout.publish(b"cccc");
    assert!(fanout.scrollback_len() <= 8);

    let capture = Capture::new();
    fanout.subscribe(capture.sink()).unwrap();
    assert!(wait_for(|| capture.bytes() == b"bbbbcccc", 2).await);
    Ok(())
}

#[tokio::test]
async fn slow_subscriber_is_evicted_with_drop_count() -> anyhow::Result<()> {
    let fanout = Fanout::new(1024, 2, 16);

    let capture = Capture::new();
    let events = Arc::clone(&capture.events);
    let sink: Sink = Box::new(move |event| {
        std::thread::sleep(Duration::from_millis(100));
        events.lock().unwrap().push(event);
        Ok(())
    });
    fanout.subscribe(sink).unwrap();

    // Queue capacity 2: the rest of the chunks count as drops until the
    // threshold trips.
    let mut evictions = Vec::new();
    for _ in 0..8 {
        evictions.extend(fanout.publish(b"12345678"));
    }
    assert_eq!(evictions.len(), 1);
    assert!(evictions[0].1 > 16);
    assert_eq!(fanout.subscriber_count(), 0);

    // The queued chunks drain, then the parting event lands.
    assert!(wait_for(|| capture.evicted().is_some(), 3).await);
    assert_eq!(capture.evicted(), Some(evictions[0].1));
    Ok(())
}

#[tokio::test]
async fn close_delivers_final_event_after_drain() -> anyhow::Result<()> {
    let fanout = Fanout::new(1024, 16, 1024 * 1024);
    let capture = Capture::new();
    fanout.subscribe(capture.sink()).unwrap();
    fanout.publish(b"payload");

    let handles = fanout.close(SinkEvent::Exited {
        exit_code: Some(0),
        signal: None,
    });
    for handle in handles {
        handle.await?;
    }

    assert_eq!(capture.bytes(), b"payload");
    assert!(capture.exited());
    assert!(fanout.is_closed());
    Ok(())
}

#[tokio::test]
async fn subscribe_after_close_is_refused() -> anyhow::Result<()> {
    let fanout = Fanout::new(1024, 16, 1024 * 1024);
    fanout.close(SinkEvent::Exited {
        exit_code: None,
        signal: None,
    });

    let capture = Capture::new();
    assert!(fanout.subscribe(capture.sink()).is_none());
    Ok(())
}

#[tokio::test]
async fn publish_after_close_is_dropped() -> anyhow::Result<()> {
    let fanout = Fanout::new(1024, 16, 1024 * 1024);
    fanout.close(SinkEvent::Exited {
        exit_code: None,
        signal: None,
    });
    assert!(fanout.publish(b"ignored").is_empty());
    assert_eq!(fanout.scrollback_len(), 0);
    Ok(())
}

#[tokio::test]
async fn remove_is_idempotent() -> anyhow::Result<()> {
    let fanout = Fanout::new(1024, 16, 1024 * 1024);
    let capture = Capture::new();
    let seq = fanout.subscribe(capture.sink()).unwrap();

    assert!(fanout.remove(seq));
    assert!(!fanout.remove(seq));
    assert_eq!(fanout.subscriber_count(), 0);

    // Publishing to an empty set is fine.
    fanout.publish(b"nobody-home");
    Ok(())
}

#[tokio::test]
async fn failing_sink_is_swept_out() -> anyhow::Result<()> {
    let fanout = Fanout::new(1024, 16, 1024 * 1024);

    let delivered = Arc::new(Mutex::new(0usize));
    let count = Arc::clone(&delivered);
    let sink: Sink = Box::new(move |_event| {
        let mut count = count.lock().unwrap();
        *count += 1;
        if *count > 1 {
            anyhow::bail!("transport collapsed");
        }
        Ok(())
    });
    fanout.subscribe(sink).unwrap();

    // First chunk delivers, second trips the sink; subsequent publishes
    // sweep the failed subscriber out of the set.
    let swept = wait_for(
        || {
            fanout.publish(b"chunk");
            fanout.subscriber_count() == 0
        },
        3,
    )
    .await;
    assert!(swept);
    Ok(())
}

#[tokio::test]
async fn independent_subscribers_do_not_interfere() -> anyhow::Result<()> {
    let fanout = Fanout::new(1024, 2, 16);

    let healthy = Capture::new();
    fanout.subscribe(healthy.sink()).unwrap();

    let stuck_events = Arc::new(Mutex::new(Vec::<SinkEvent>::new()));
    let stuck_clone = Arc::clone(&stuck_events);
    let stuck: Sink = Box::new(move |event| {
        std::thread::sleep(Duration::from_millis(200));
        stuck_clone.lock().unwrap().push(event);
        Ok(())
    });
    fanout.subscribe(stuck).unwrap();

    for _ in 0..8 {
        fanout.publish(b"12345678");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The healthy subscriber got everything; the stuck one was evicted.
    assert!(wait_for(|| healthy.bytes().len() == 64, 2).await);
    assert!(wait_for(|| fanout.subscriber_count() == 1, 2).await);
    Ok(())
}
