mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use gridbus::{
    bus::{Callback, InMemoryBroker, RouterError},
    BusError, Message, TopicRouter,
};
use parking_lot::Mutex;

use common::{connected_bus, eventually, settle};

fn counting() -> (Callback, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let callback = Callback::from_fn(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (callback, hits)
}

#[tokio::test]
async fn test_exact_topics_reach_only_their_callbacks() {
    let router = TopicRouter::new(1);
    let topics = ["/topic/a.b", "/topic/a.c", "/queue/a.b", "x.y"];
    let counters: Vec<_> = topics
        .iter()
        .map(|topic| {
            let (callback, hits) = counting();
            router.add_callback(topic, callback).unwrap();
            hits
        })
        .collect();

    router.on_message(Message::new("/topic/a.b", "1")).unwrap();
    router.on_message(Message::new("/queue/x.y", "2")).unwrap();
    router.on_message(Message::new("/topic/unrelated", "3")).unwrap();

    assert!(eventually(|| counters[3].load(Ordering::SeqCst) == 1).await);
    settle().await;
    let hits: Vec<usize> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(hits, vec![1, 0, 0, 1]);
}

#[tokio::test]
async fn test_wildcard_segments() {
    let router = TopicRouter::new(1);
    let (star, star_hits) = counting();
    let (tail, tail_hits) = counting();
    router.add_callback("/topic/a.b.*", star).unwrap();
    router.add_callback("/topic/a.b.>", tail).unwrap();
    assert_eq!(router.wildcard_pattern_count(), 2);

    for destination in ["/topic/a.b.c", "/topic/a.b.c.d", "/topic/a.b", "/topic/xa.b.c"] {
        router.on_message(Message::new(destination, "")).unwrap();
    }

    assert!(eventually(|| tail_hits.load(Ordering::SeqCst) == 2).await);
    settle().await;
    assert_eq!(star_hits.load(Ordering::SeqCst), 1);
    assert_eq!(tail_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_exact_subscription_takes_precedence() {
    let router = TopicRouter::new(1);
    let (exact, exact_hits) = counting();
    let (wildcard, wildcard_hits) = counting();
    router.add_callback("/topic/field.switch1", exact).unwrap();
    router.add_callback("/topic/field.*", wildcard).unwrap();

    router.on_message(Message::new("/topic/field.switch1", "")).unwrap();
    router.on_message(Message::new("/topic/field.switch2", "")).unwrap();

    assert!(eventually(|| wildcard_hits.load(Ordering::SeqCst) == 1).await);
    settle().await;
    assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
    assert_eq!(wildcard_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dispatch_follows_queue_order() {
    let router = TopicRouter::new(1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    router
        .add_callback(
            "/topic/ordered",
            Callback::new(move |message: Message| {
                let sink = sink.clone();
                async move {
                    tokio::task::yield_now().await;
                    sink.lock().push(message.body);
                }
            }),
        )
        .unwrap();

    for i in 0..100 {
        router
            .on_message(Message::new("/topic/ordered", i.to_string()))
            .unwrap();
    }

    assert!(eventually(|| seen.lock().len() == 100).await);
    let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
    assert_eq!(*seen.lock(), expected);
}

#[tokio::test]
async fn test_concurrent_subscribe_while_dispatching() {
    let router = Arc::new(TopicRouter::new(4));
    let (steady, steady_hits) = counting();
    router.add_callback("/topic/steady", steady).unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let router = router.clone();
        tasks.push(tokio::spawn(async move {
            for j in 0..25 {
                let topic = format!("/topic/churn.{}.{}", i, j);
                let callback = Callback::from_fn(|_| {});
                router.add_callback(&topic, callback.clone()).unwrap();
                router.on_message(Message::new("/topic/steady", "")).unwrap();
                assert!(router.remove_callback(&topic, &callback).unwrap());
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(eventually(|| steady_hits.load(Ordering::SeqCst) == 200).await);
    assert_eq!(router.patterns(), vec!["/topic/steady".to_string()]);
}

#[tokio::test]
async fn test_bus_client_rejects_duplicate_and_fires_both_callbacks() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = connected_bus("feeder1", &broker).await;
    let (first, first_hits) = counting();
    let (second, second_hits) = counting();

    bus.subscribe("/topic/goss.gridappsd.field.feeder1", first.clone())
        .await
        .unwrap();
    let err = bus
        .subscribe("/topic/goss.gridappsd.field.feeder1", first)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BusError::Router(RouterError::DuplicateCallback { .. })
    ));
    bus.subscribe("/topic/goss.gridappsd.field.feeder1", second)
        .await
        .unwrap();

    bus.send("/topic/goss.gridappsd.field.feeder1", &serde_json::json!({"v": 1}))
        .await
        .unwrap();

    assert!(eventually(|| second_hits.load(Ordering::SeqCst) == 1).await);
    settle().await;
    assert_eq!(first_hits.load(Ordering::SeqCst), 1);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bus_client_unsubscribe_stops_delivery() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = connected_bus("feeder1", &broker).await;
    let (callback, hits) = counting();

    bus.subscribe("/topic/a.>", callback.clone()).await.unwrap();
    bus.send("/topic/a.b", "one").await.unwrap();
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 1).await);

    bus.unsubscribe("/topic/a.>", &callback).await.unwrap();
    assert!(!bus.has_subscription("/topic/a.>"));
    bus.send("/topic/a.b", "two").await.unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
