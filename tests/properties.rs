//! Property-flavored checks that are easiest to state against the public
//! surface rather than inside a single crate: the status parser's
//! round-trip stability and the slot semaphore's capacity bound under
//! concurrent load.

use overpass::{Client, ClientConfig, Query, QueryContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// re-parsing a status snapshot's own `Display` output is not
/// well-defined (the wire format is free text, not the `Display` format),
/// but parsing the same body twice must be stable and side-effect free.
#[test]
fn l1_parsing_status_body_twice_is_stable() {
    let bodies = [
        "Rate limit: 0\n",
        "Rate limit: 2\n2 slots available now.\n",
        "Rate limit: 2\nSlot available after: 2024-01-01T00:00:00Z, in 5 seconds.\nAnnounced endpoint: gall.openstreetmap.de\n",
        "Rate limit: 4\n1 slots available now.\nSlot available after: 2024-01-01T00:00:01Z, in 3 seconds.\nSlot available after: 2024-01-01T00:00:02Z, in 7 seconds.\nAnnounced endpoint: none\nCurrently running queries (pid, space limit, time limit, start time):\n123\t0\t0\t2024-01-01T00:00:00Z\n",
    ];

    for body in bodies {
        let first = overpass_status::parse_status(body).unwrap();
        let second = overpass_status::parse_status(body).unwrap();
        assert_eq!(first, second, "parsing {body:?} twice diverged");
    }
}

struct CountingResponder {
    concurrent: Arc<AtomicUsize>,
    max_observed: Arc<AtomicUsize>,
}

impl Respond for CountingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "version": 0.6,
            "generator": "Overpass API",
            "osm3s": {"timestamp_osm_base": "2024-01-01T00:00:00Z", "copyright": "OSM"},
            "elements": [],
        }))
    }
}

/// the number of outstanding `/api/interpreter` requests never exceeds
/// the slot semaphore's capacity, even when many queries are run
/// concurrently on the same client.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn p5_concurrent_interpreter_calls_never_exceed_advertised_slots() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Rate limit: 2\n2 slots available now.\n"))
        .mount(&server)
        .await;

    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/interpreter"))
        .respond_with(CountingResponder {
            concurrent: Arc::clone(&concurrent),
            max_observed: Arc::clone(&max_observed),
        })
        .mount(&server)
        .await;

    let client = Arc::new(
        Client::new(
            ClientConfig::builder()
                .base_url(format!("{}/", server.uri()))
                .build()
                .unwrap(),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = Arc::clone(&client);
        let query = Arc::new(Query::new("node(1);out;", QueryContext::new().with("i", i.to_string())).unwrap());
        handles.push(tokio::spawn(async move {
            client.run_query(&query, true).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(
        max_observed.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent interpreter calls, slot capacity was 2",
        max_observed.load(Ordering::SeqCst)
    );
}
