//! End-to-end pub/sub and segmented fetch over an in-process face.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use ndnkit_core::{
    segment, Config, Face, LocalFace, Message, Name, NamedCache, PumpConfig, Publisher, Request,
    Response, SegmentAssembler, SegmentedClient, Subscriber,
};

fn topic() -> Name {
    "/sensors/temp".parse().unwrap()
}

fn pump(face: &LocalFace, n: usize) {
    for _ in 0..n {
        face.pump().unwrap();
    }
}

fn subscribe(sub: &Subscriber) -> Arc<Mutex<Vec<Message>>> {
    let got = Arc::new(Mutex::new(Vec::new()));
    let g = got.clone();
    sub.subscribe(move |m| g.lock().push(m), |e| panic!("subscriber error: {e}"))
        .unwrap();
    got
}

#[test]
fn pending_request_answered_without_extra_round_trip() {
    let face = Arc::new(LocalFace::new());
    let config = Config::default();
    let publisher = Publisher::with_id(face.clone(), topic(), 1, &config).unwrap();
    publisher.open().unwrap();
    let sub = Subscriber::new(face.clone(), topic(), &config).unwrap();
    sub.open().unwrap();

    let sent_at_delivery = Arc::new(Mutex::new(Vec::new()));
    let (s, f) = (sent_at_delivery.clone(), face.clone());
    sub.subscribe(move |m| s.lock().push((m.sequence, f.sent_requests())), |_| {})
        .unwrap();
    // Discovery, then the "latest" request parks in the publisher's table.
    pump(&face, 3);

    let before = face.sent_requests();
    publisher.publish(b"21.5".to_vec()).unwrap();
    assert_eq!(face.sent_requests(), before);
    face.pump().unwrap();
    assert_eq!(*sent_at_delivery.lock(), vec![(0, before)]);

    // The next message request is already parked too.
    pump(&face, 2);
    let before = face.sent_requests();
    publisher.publish(b"21.7".to_vec()).unwrap();
    face.pump().unwrap();
    assert_eq!(sent_at_delivery.lock()[1], (1, before));
}

#[test]
fn late_subscriber_catches_up_in_order_then_goes_live() {
    let face = Arc::new(LocalFace::new());
    let config = Config::default();
    let publisher = Publisher::with_id(face.clone(), topic(), 7, &config).unwrap();
    publisher.open().unwrap();
    for i in 0..3 {
        publisher.publish(format!("m{i}").into_bytes()).unwrap();
    }

    let sub = Subscriber::new(face.clone(), topic(), &config).unwrap();
    sub.open().unwrap();
    let got = subscribe(&sub);
    pump(&face, 10);
    let seen: Vec<u64> = got.lock().iter().map(|m| m.sequence).collect();
    assert_eq!(seen, vec![0, 1, 2]);

    publisher.publish(b"m3".to_vec()).unwrap();
    face.pump().unwrap();
    let got = got.lock();
    assert_eq!(got.len(), 4);
    assert_eq!(got[3].sequence, 3);
    assert_eq!(got[3].content, b"m3");
    assert!(got.iter().all(|m| m.publisher_id == 7));
}

#[test]
fn segmented_fetch_through_cache_push() {
    let face = Arc::new(LocalFace::new());
    let prefix: Name = "/files/report".parse().unwrap();
    let content: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let cache = Arc::new(Mutex::new(NamedCache::new()));
    cache.lock().put_content(prefix.clone(), content.clone());

    let c = cache.clone();
    let _registration = face
        .register_provider(
            prefix.clone(),
            Arc::new(move |req: &Request| {
                let base = segment::strip_segment(&req.name);
                let wanted = segment::segment_id(&req.name).ok().flatten().unwrap_or(0);
                let mut answer = None;
                c.lock()
                    .push(&Request::new(base), 4096, |r| {
                        if segment::segment_id(&r.name) == Ok(Some(wanted)) {
                            answer = Some(r);
                        }
                    })
                    .ok()?;
                answer
            }),
        )
        .unwrap();

    let client =
        SegmentedClient::from_config(face.clone(), &Config::default()).with_pump(PumpConfig {
            interval: None,
            max_iterations: Some(1_000),
        });
    let got = client.get(Request::new(prefix.clone())).unwrap();
    assert_eq!(got.name, prefix);
    assert_eq!(got.content, content);
    assert_eq!(client.stats().total_retries(), 0);
}

#[test]
fn shuffled_fragments_reassemble() {
    let base: Name = "/blob".parse().unwrap();
    let whole: Vec<u8> = (0..=255u8).collect();
    let mut fragments = segment::segment_response(&Response::new(base.clone(), whole.clone()), 16);
    assert_eq!(fragments.len(), 16);
    fragments.shuffle(&mut rand::thread_rng());

    let assembler = SegmentAssembler::new(base.clone());
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = order.clone();
    assembler.on_data(move |r| o.lock().push(segment::segment_id(&r.name).unwrap().unwrap()));
    for f in fragments {
        assembler.receive(f);
    }
    assert_eq!(*order.lock(), (0..16).collect::<Vec<u64>>());
    let assembled = assembler.assemble().unwrap();
    assert_eq!(assembled.name, base);
    assert_eq!(assembled.content, whole);
}
