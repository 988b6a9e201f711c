//! Cross-process pub/sub semantics, exercised with in-process worker links
//! (each simulated worker owns its own bus, exactly like a spawned worker
//! process would).

use std::sync::{Arc, Mutex};

use brisk::pubsub::{
    Bus, ClusterLink, ClusterRoot, Engine, Message, OnMessage, PublishOptions, SubscribeOptions,
    Target,
};
use tokio::time::{Duration, timeout};

fn collector(bus: &Bus, channel: &str) -> (brisk::pubsub::Subscription, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let cb: OnMessage = Arc::new(move |msg: &Message| {
        seen2
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&msg.payload).into_owned());
    });
    (
        bus.subscribe(SubscribeOptions::channel(channel.to_owned(), cb)),
        seen,
    )
}

struct Mesh {
    _root: ClusterRoot,
    root_bus: Bus,
    worker_buses: Vec<Bus>,
    worker_engines: Vec<Arc<ClusterLink>>,
}

async fn mesh(workers: usize, dir: &std::path::Path) -> Mesh {
    let path = dir.join("mesh.sock");
    let root_bus = Bus::new();
    let root = ClusterRoot::bind_at(root_bus.clone(), path.clone()).unwrap();

    let mut worker_buses = Vec::new();
    let mut worker_engines = Vec::new();
    for _ in 0..workers {
        let bus = Bus::new();
        let link = Arc::new(ClusterLink::connect_at(bus.clone(), path.clone()));
        bus.attach(link.clone() as Arc<dyn Engine>);
        bus.set_default_engine(Some(link.clone() as Arc<dyn Engine>));
        worker_buses.push(bus);
        worker_engines.push(link);
    }
    // Give the links a beat to establish.
    tokio::time::sleep(Duration::from_millis(150)).await;
    Mesh {
        _root: root,
        root_bus,
        worker_buses,
        worker_engines,
    }
}

#[tokio::test]
async fn publish_on_one_worker_reaches_subscribers_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = mesh(2, dir.path()).await;

    let (_sub_a, seen_a) = collector(&mesh.worker_buses[0], "c");
    let (_sub_b, seen_b) = collector(&mesh.worker_buses[1], "c");
    let (_sub_root, seen_root) = collector(&mesh.root_bus, "c");

    mesh.worker_buses[0].publish(PublishOptions::new("c", "hello"));

    timeout(Duration::from_secs(3), async {
        loop {
            let done = !seen_a.lock().unwrap().is_empty()
                && !seen_b.lock().unwrap().is_empty()
                && !seen_root.lock().unwrap().is_empty();
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fan-out");

    assert_eq!(seen_a.lock().unwrap().len(), 1, "publisher-side delivery");
    assert_eq!(seen_b.lock().unwrap().len(), 1, "remote worker delivery");
    assert_eq!(seen_root.lock().unwrap().len(), 1, "root delivery");
}

#[tokio::test]
async fn concurrent_publishers_preserve_per_sender_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = mesh(2, dir.path()).await;
    const EACH: usize = 100;

    let (_sub_a, seen_a) = collector(&mesh.worker_buses[0], "c");
    let (_sub_b, seen_b) = collector(&mesh.worker_buses[1], "c");

    for i in 0..EACH {
        mesh.worker_buses[0].publish(PublishOptions::new("c", format!("a-{i:03}")));
        mesh.worker_buses[1].publish(PublishOptions::new("c", format!("b-{i:03}")));
    }

    timeout(Duration::from_secs(5), async {
        loop {
            if seen_a.lock().unwrap().len() == 2 * EACH && seen_b.lock().unwrap().len() == 2 * EACH
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("all deliveries arrive exactly once");

    for seen in [&seen_a, &seen_b] {
        let seen = seen.lock().unwrap();
        let from_a: Vec<&String> = seen.iter().filter(|m| m.starts_with("a-")).collect();
        let from_b: Vec<&String> = seen.iter().filter(|m| m.starts_with("b-")).collect();
        assert_eq!(from_a.len(), EACH);
        assert_eq!(from_b.len(), EACH);
        assert!(from_a.windows(2).all(|w| w[0] < w[1]), "per-sender order from a");
        assert!(from_b.windows(2).all(|w| w[0] < w[1]), "per-sender order from b");
    }
}

#[tokio::test]
async fn pattern_subscription_matches_across_the_mesh() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = mesh(2, dir.path()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let cb: OnMessage = Arc::new(move |msg: &Message| {
        seen2.lock().unwrap().push((
            String::from_utf8_lossy(&msg.channel).into_owned(),
            String::from_utf8_lossy(&msg.payload).into_owned(),
        ));
    });
    let _sub = mesh.worker_buses[1].subscribe(SubscribeOptions::pattern("user.*", cb));

    mesh.worker_buses[0].publish(PublishOptions::new("user.42", "match"));
    mesh.worker_buses[0].publish(PublishOptions::new("admin.1", "no match"));

    timeout(Duration::from_secs(3), async {
        loop {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pattern delivery");
    // A beat for the non-matching message to (not) arrive.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "user.42");
    assert_eq!(seen[0].1, "match");
}

#[tokio::test]
async fn local_target_never_crosses_the_mesh() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = mesh(2, dir.path()).await;

    let (_sub_a, seen_a) = collector(&mesh.worker_buses[0], "private");
    let (_sub_b, seen_b) = collector(&mesh.worker_buses[1], "private");

    mesh.worker_buses[0].publish(PublishOptions::new("private", "stay").target(Target::Local));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(seen_a.lock().unwrap().len(), 1);
    assert!(seen_b.lock().unwrap().is_empty());
    let _ = &mesh.worker_engines;
}
