use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use vcdb::model::QualifiedName;
use vcdb::store::{MemoryStore, RelationStore};
use vcdb::VcsConfig;

// Test client wrapper for making API calls
struct TestClient {
    client: Client,
    base_url: String,
    session: String,
}

impl TestClient {
    fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            session: "default".to_string(),
        }
    }

    fn with_session(&self, session: &str) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            session: session.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-user-id", "alice")
            .header("x-session-id", &self.session)
    }

    async fn post(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.request(reqwest::Method::POST, path).json(&json).send().await
    }

    async fn put(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.request(reqwest::Method::PUT, path).json(&json).send().await
    }

    async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.request(reqwest::Method::GET, path).send().await
    }

    async fn delete(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.request(reqwest::Method::DELETE, path).send().await
    }
}

async fn spawn_server(store: MemoryStore) -> TestClient {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(vcdb::serve(store, listener, VcsConfig::default()));

    let client = TestClient::new(format!("http://{}", address));
    // The root branch is bootstrapped before the first request is served
    for _ in 0..50 {
        if let Ok(response) = client.get("/branches").await {
            if response.status() == StatusCode::OK {
                let body: Value = response.json().await.unwrap();
                if body["total"] == 1 {
                    return client;
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("server did not come up");
}

fn table_change(definition: &str) -> Value {
    json!({
        "changes": [{
            "op": "upsert",
            "identity": {"object_type": "table", "schema_name": "public", "object_name": "orders"},
            "definition": definition
        }],
        "message": "update orders"
    })
}

#[tokio::test]
async fn test_schema_branch_merge_workflow() {
    let client = spawn_server(MemoryStore::new()).await;

    let response = client
        .post("/branches/main/objects", table_change("CREATE TABLE orders (id int)"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let committed: Value = response.json().await.unwrap();
    assert_eq!(committed["commit"]["author"], "alice");
    assert_eq!(committed["warnings"], json!([]));

    let response = client
        .post("/branches", json!({"name": "feature", "description": "new columns"}))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    client
        .post("/branches/main/objects", table_change("CREATE TABLE orders (id int, total numeric)"))
        .await
        .unwrap();
    client
        .post("/branches/feature/objects", table_change("CREATE TABLE orders (id int, status text)"))
        .await
        .unwrap();

    // Diverged edits of the same table conflict
    let merge: Value = client
        .post("/merges", json!({"source": "feature", "target": "main"}))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(merge["status"], "CONFLICTS_DETECTED");
    let merge_id = merge["merge_id"].as_str().unwrap().to_string();
    assert_eq!(merge["result"], format!("CONFLICTS_DETECTED:{}", merge_id));

    let conflicts: Value = client
        .get(&format!("/merges/{}/conflicts", merge_id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(conflicts["total"], 1);
    assert_eq!(conflicts["items"][0]["conflict_type"], "modify-modify");
    let conflict_id = conflicts["items"][0]["id"].as_str().unwrap().to_string();

    let resolved: Value = client
        .post(
            &format!("/merges/{}/conflicts/{}/resolve", merge_id, conflict_id),
            json!({"strategy": "TAKE_SOURCE", "apply": true}),
        )
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["remaining_conflicts"], 0);
    assert!(resolved["applied_commit_sha"].is_string());

    let snapshot: Value = client
        .get("/branches/main/snapshot")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        snapshot["objects"][0]["definition"],
        "CREATE TABLE orders (id int, status text)"
    );

    let record: Value = client
        .get(&format!("/merges/{}", merge_id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["status"], "RESOLVED");

    // The merged branch can be deleted without force
    let response = client.delete("/branches/feature").await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let branches: Value = client
        .get("/branches?include_deleted=true&order_by=name%20asc")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(branches["items"][0]["name"], "feature");
    assert_eq!(branches["items"][0]["status"], "DELETED");

    let log: Value = client
        .get("/branches/main/log?limit=1")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(log["total"], 1);
    assert_eq!(log["items"][0]["parent_shas"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_error_responses() {
    let client = spawn_server(MemoryStore::new()).await;

    let response = client.delete("/branches/main").await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    let response = client.get("/branches/ghost/log").await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client.post("/branches", json!({"name": "has space"})).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .post("/tags", json!({"name": "v1", "commit_sha": "0000"}))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_data_branch_workflow() {
    let store = MemoryStore::new();
    let orders = QualifiedName::new("public", "orders");
    store
        .create_relation(&orders, Some(vec!["id".into()]))
        .unwrap();
    for id in 1..=2 {
        let row = json!({"id": id, "total": id * 10});
        store
            .insert_row(&orders, row.as_object().cloned().unwrap())
            .await
            .unwrap();
    }

    let on_main = spawn_server(store).await;
    let on_feature = on_main.with_session("feature-session");

    on_main
        .post("/branches", json!({"name": "feature"}))
        .await
        .unwrap();
    let created: Value = on_main
        .post("/data/branches", json!({"branch": "feature", "tables": ["public.orders"]}))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["tables_copied"], 1);

    let switched: Value = on_feature
        .post("/data/switch", json!({"branch": "feature"}))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(switched["previous_branch"], "main");
    assert_eq!(switched["current_branch"], "feature");

    on_main
        .put("/data/tables/public.orders/rows", json!({"id": 1, "total": 11}))
        .await
        .unwrap();
    let updated: Value = on_feature
        .put("/data/tables/public.orders/rows", json!({"id": 1, "total": 12}))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["affected"], 1);

    let detected: Value = on_main
        .post(
            "/data/conflicts/detect",
            json!({"merge_id": "m-1", "table": "public.orders", "source": "feature", "target": "main"}),
        )
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detected["conflicts"], 1);

    let conflicts: Value = on_main
        .get("/data/merges/m-1/conflicts")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(conflicts["items"][0]["conflict_type"], "update-update");

    let summary: Value = on_main
        .post(
            "/data/merges/m-1/apply",
            json!({"source": "feature", "target": "main", "strategy": "source"}),
        )
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["rows_upserted"], 1);

    let rows: Value = on_main
        .get("/data/tables/public.orders/rows")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let first = rows["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["id"] == 1)
        .unwrap();
    assert_eq!(first["total"], 12);
}
