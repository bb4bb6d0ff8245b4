use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use snapdex::core::{IndexMode, MemoryContentStore, Mutation, StoreRef};
use snapdex::index::{IndexTracker, MemoryBackend, TrackerOptions};
use snapdex::query::{IndexContext, QueryRegistry, QueryServer};

async fn spawn_server() -> (String, Arc<IndexTracker>) {
    let s = StoreRef::new("site");
    let content = Arc::new(MemoryContentStore::new());
    content.create_store(&s);
    let backend = Arc::new(MemoryBackend::in_memory());
    let tracker = IndexTracker::start(
        content.clone(),
        backend.clone(),
        TrackerOptions {
            worker_threads: 1,
            ..Default::default()
        },
    )
    .unwrap();

    tracker.create_index(&s, IndexMode::Asynchronous).unwrap();
    let n = content
        .commit(
            &s,
            vec![
                Mutation::file("/reports/q1.txt", "revenue grew in the north")
                    .with_property("cm:title", "Quarterly"),
                Mutation::file("/reports/q2.txt", "revenue fell"),
                Mutation::file("/notes/todo.txt", "buy milk"),
            ],
        )
        .unwrap();
    tracker.index(&s, 0, n, IndexMode::Asynchronous).unwrap();
    assert!(tracker.wait_idle(Duration::from_secs(10)));

    let registry = Arc::new(QueryRegistry::with_builtin(IndexContext::new(backend)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = QueryServer::new(registry, tracker.clone());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (format!("http://{}", addr), tracker)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn search_endpoints_answer_over_http() {
    let (base, _tracker) = spawn_server().await;
    let client = reqwest::Client::new();

    let langs: Vec<String> = client
        .get(format!("{}/languages", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(langs, vec!["cmis-alfresco", "cmis-strict", "fts-alfresco", "lucene"]);

    let body: Value = client
        .get(format!("{}/search", base))
        .query(&[("q", "revenue"), ("store", "site"), ("max", "1")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 2);
    assert_eq!(body["rows"].as_array().unwrap().len(), 1);
    assert_eq!(body["limit_reason"], "max_items");

    let body: Value = client
        .get(format!("{}/search", base))
        .query(&[
            ("lang", "CMIS-STRICT"),
            ("q", "SELECT cmis:name FROM cmis:document WHERE IN_FOLDER('/notes')"),
            ("store", "site"),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["rows"][0]["values"]["cmis:name"], "todo.txt");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn errors_map_to_client_status_codes() {
    let (base, _tracker) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/search", base))
        .query(&[("lang", "nonexistent"), ("q", "x"), ("store", "site")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = client
        .get(format!("{}/search", base))
        .query(&[("q", "(unbalanced"), ("store", "site")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("unbalanced"));

    let resp = client
        .get(format!("{}/search", base))
        .query(&[("q", "x"), ("store", "missing")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    let resp = client
        .get(format!("{}/stores/missing/verify", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    let resp = client.post(format!("{}/backup", base)).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_and_verify_report_store_state() {
    let (base, _tracker) = spawn_server().await;
    let client = reqwest::Client::new();

    let status: Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["pending_tasks"], 0);
    assert_eq!(status["stores"][0]["store"], "site");
    assert_eq!(status["stores"][0]["last_searchable"], 1);

    let drift: Value = client
        .get(format!("{}/stores/site/verify", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(drift["missing_entries"].as_array().map(|a| a.len()), Some(0));
}
