use super::super::*;
use crate::config::Config;
use tokio::net::TcpListener;

async fn spawn_service(worker_url: &str, provider_url: &str) -> (String, ServiceState) {
    let mut config = Config::default();
    config.worker_server_url = worker_url.to_string();
    config.providers_server_url = provider_url.to_string();
    let state = ServiceState::new(&config);
    let app = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn text_worker_reply() -> String {
    serde_json::json!({
        "task_id": "ignored",
        "status": "completed",
        "result": {
            "worker_name": "text",
            "steps": [{
                "step": "Text_Classification",
                "checks": [{
                    "check_id": "text_1",
                    "analysis_agent": "LLM_text_classifier",
                    "weight": 1.0,
                    "risk_level": "low",
                    "confidence": 0.9,
                    "explanation": "harmless greeting",
                }],
            }],
        },
    })
    .to_string()
}

fn mixed_link_worker_reply() -> String {
    let check = |id: &str, weight: f64, risk: &str, confidence: f64| {
        serde_json::json!({
            "check_id": id,
            "analysis_agent": "LLM_html_analyzer",
            "weight": weight,
            "risk_level": risk,
            "confidence": confidence,
            "explanation": "",
        })
    };
    serde_json::json!({
        "task_id": "ignored",
        "status": "completed",
        "result": {
            "worker_name": "link",
            "steps": [
                {"step": "Page_Accessibility", "checks": [check("page", 0.2, "low", 1.0)]},
                {"step": "Content_Analysis", "checks": [
                    check("html", 0.255, "high", 0.85),
                    check("s0", 0.015, "low", 0.9),
                    check("s1", 0.015, "low", 0.9),
                    check("s2", 0.015, "low", 0.9),
                ]},
                {"step": "LLM_Link_Suspiciousness", "checks": [check("overall", 0.5, "low", 0.95)]},
            ],
        },
    })
    .to_string()
}

fn aggregator_reply(risk: &str, confidence: f64) -> String {
    let verdict = serde_json::json!({
        "risk_level": risk,
        "confidence": confidence,
        "reasons": {
            "Text_Classification": [
                {"check_id": "text_1", "risk_level": risk, "confidence": confidence, "weight": 1.0}
            ],
        },
    })
    .to_string();
    serde_json::json!({"status": "success", "response": verdict}).to_string()
}

#[tokio::test]
async fn happy_path_message_analysis() {
    let mut worker = mockito::Server::new_async().await;
    let _worker = worker
        .mock("POST", "/request_worker")
        .with_status(200)
        .with_body(text_worker_reply())
        .create_async()
        .await;
    let mut provider = mockito::Server::new_async().await;
    let _aggregator = provider
        .mock("POST", "/llm/chat_complete")
        .with_status(200)
        .with_body(aggregator_reply("low", 0.9))
        .create_async()
        .await;

    let (base, _state) = spawn_service(&worker.url(), &provider.url()).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/analyze_message"))
        .json(&serde_json::json!({"message": "Hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();

    assert_eq!(body["status"], "completed");
    let task_id = body["task_id"].as_str().unwrap().to_string();
    assert!(task_id.starts_with("message_analysis-"));
    assert_eq!(body["result"]["risk_level"], "low");
    assert!((body["result"]["confidence"].as_f64().unwrap() - 0.9).abs() < 1e-9);

    // Round trip: the stored verdict equals the one in the envelope.
    let status: serde_json::Value = client
        .get(format!("{base}/get_task_status?task_id={task_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "completed");
    assert_eq!(status["result"], body["result"]);
}

#[tokio::test]
async fn deterministic_tiebreak_overrides_a_two_level_disagreement() {
    let mut worker = mockito::Server::new_async().await;
    let _worker = worker
        .mock("POST", "/request_worker")
        .with_status(200)
        .with_body(mixed_link_worker_reply())
        .create_async()
        .await;
    let mut provider = mockito::Server::new_async().await;
    let _aggregator = provider
        .mock("POST", "/llm/chat_complete")
        .with_status(200)
        .with_body(aggregator_reply("high", 0.8))
        .create_async()
        .await;

    let (base, _state) = spawn_service(&worker.url(), &provider.url()).await;
    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .post(format!("{base}/analyze_link"))
        .json(&serde_json::json!({"url": "http://example.com"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // Weighted score 0.255 < 0.33: deterministic label is low, two
    // levels away from the aggregator's high.
    assert_eq!(body["status"], "completed");
    assert_eq!(body["result"]["risk_level"], "low");
    assert_eq!(body["result"]["reasons"]["override"], "deterministic_tiebreak");
}

#[tokio::test]
async fn sandbox_unavailable_surfaces_as_business_error() {
    let mut worker = mockito::Server::new_async().await;
    let _worker = worker
        .mock("POST", "/request_worker")
        .with_status(200)
        .with_body(
            serde_json::json!({
                "task_id": "ignored",
                "status": "error",
                "error": "Sandbox unavailable",
            })
            .to_string(),
        )
        .create_async()
        .await;
    let provider = mockito::Server::new_async().await;

    let (base, state) = spawn_service(&worker.url(), &provider.url()).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/analyze_file_dynamic"))
        .json(&serde_json::json!({"file_ref": "x.bin"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Sandbox unavailable");

    let task_id = body["task_id"].as_str().unwrap();
    let stored = state.store().get(task_id).unwrap();
    assert_eq!(stored.status, crate::models::TaskStatus::Error);
    assert_eq!(stored.error.as_deref(), Some("Sandbox unavailable"));
}

#[tokio::test]
async fn aggregator_retries_once_on_non_json() {
    let mut worker = mockito::Server::new_async().await;
    let _worker = worker
        .mock("POST", "/request_worker")
        .with_status(200)
        .with_body(text_worker_reply())
        .create_async()
        .await;

    let mut provider = mockito::Server::new_async().await;
    // First call gets prose; the reinforced retry gets valid JSON.
    let _first = provider
        .mock("POST", "/llm/chat_complete")
        .match_body(mockito::Matcher::Any)
        .with_status(200)
        .with_body(r#"{"status": "success", "response": "not json"}"#)
        .create_async()
        .await;
    let _retry = provider
        .mock("POST", "/llm/chat_complete")
        .match_body(mockito::Matcher::Regex(
            "previous reply was not valid JSON".to_string(),
        ))
        .with_status(200)
        .with_body(aggregator_reply("medium", 0.7))
        .create_async()
        .await;

    let (base, _state) = spawn_service(&worker.url(), &provider.url()).await;
    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .post(format!("{base}/analyze_message"))
        .json(&serde_json::json!({"message": "Hello"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "completed");
    assert_eq!(body["result"]["risk_level"], "medium");
}

#[tokio::test]
async fn aggregator_double_failure_degrades_with_worker_result() {
    let mut worker = mockito::Server::new_async().await;
    let _worker = worker
        .mock("POST", "/request_worker")
        .with_status(200)
        .with_body(text_worker_reply())
        .create_async()
        .await;
    let mut provider = mockito::Server::new_async().await;
    let _aggregator = provider
        .mock("POST", "/llm/chat_complete")
        .with_status(200)
        .with_body(r#"{"status": "success", "response": "still not json"}"#)
        .expect(2)
        .create_async()
        .await;

    let (base, state) = spawn_service(&worker.url(), &provider.url()).await;
    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .post(format!("{base}/analyze_message"))
        .json(&serde_json::json!({"message": "Hello"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "error");
    // Degraded result: the raw worker findings ride along.
    assert_eq!(body["worker_result"]["worker_name"], "text");
    let task_id = body["task_id"].as_str().unwrap();
    assert_eq!(
        state.store().get(task_id).unwrap().status,
        crate::models::TaskStatus::Error
    );
}

#[tokio::test]
async fn unreachable_worker_is_a_handled_business_error() {
    let provider = mockito::Server::new_async().await;
    let (base, _state) = spawn_service("http://127.0.0.1:1", &provider.url()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/analyze_message"))
        .json(&serde_json::json!({"message": "Hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Analysis backend unavailable");
}

#[tokio::test]
async fn validation_failures_are_400_and_create_no_task() {
    let worker = mockito::Server::new_async().await;
    let provider = mockito::Server::new_async().await;
    let (base, state) = spawn_service(&worker.url(), &provider.url()).await;
    let client = reqwest::Client::new();

    // Empty message.
    let response = client
        .post(format!("{base}/analyze_message"))
        .json(&serde_json::json!({"message": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Missing field.
    let response = client
        .post(format!("{base}/analyze_message"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Unsupported scheme.
    let response = client
        .post(format!("{base}/analyze_link"))
        .json(&serde_json::json!({"url": "file:///etc/passwd"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Invalid URL");

    assert!(state.store().is_empty());
}

#[tokio::test]
async fn dropped_request_marks_the_task_cancelled() {
    let mut worker = mockito::Server::new_async().await;
    // Worker is slow enough that the client disconnects first.
    let _worker = worker
        .mock("POST", "/request_worker")
        .with_status(200)
        .with_body_from_request(|_| {
            std::thread::sleep(std::time::Duration::from_millis(500));
            text_worker_reply().into_bytes()
        })
        .create_async()
        .await;
    let provider = mockito::Server::new_async().await;

    let (base, state) = spawn_service(&worker.url(), &provider.url()).await;
    let client = reqwest::Client::new();
    let request = client
        .post(format!("{base}/analyze_message"))
        .json(&serde_json::json!({"message": "Hello"}))
        .timeout(std::time::Duration::from_millis(100))
        .send();
    // The client gives up while the service is still waiting on the
    // worker; dropping the connection cancels the handler.
    assert!(request.await.is_err());

    tokio::time::sleep(std::time::Duration::from_millis(700)).await;
    let tasks = state.store().list();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, crate::models::TaskStatus::Error);
    assert_eq!(tasks[0].error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn unknown_task_id_is_404() {
    let worker = mockito::Server::new_async().await;
    let provider = mockito::Server::new_async().await;
    let (base, _state) = spawn_service(&worker.url(), &provider.url()).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base}/get_task_status?task_id=message_analysis-nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Task not found");
}

#[tokio::test]
async fn available_services_lists_all_five() {
    let worker = mockito::Server::new_async().await;
    let provider = mockito::Server::new_async().await;
    let (base, _state) = spawn_service(&worker.url(), &provider.url()).await;

    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .get(format!("{base}/available_services"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let services = body.as_array().unwrap();
    assert_eq!(services.len(), 5);
    assert!(services
        .iter()
        .any(|s| s["service_name"] == "file_dynamic_analysis"));
    assert!(services.iter().all(|s| s["description"].is_string()));
}

#[tokio::test]
async fn tasks_listing_reflects_created_tasks() {
    let mut worker = mockito::Server::new_async().await;
    let _worker = worker
        .mock("POST", "/request_worker")
        .with_status(200)
        .with_body(text_worker_reply())
        .create_async()
        .await;
    let mut provider = mockito::Server::new_async().await;
    let _aggregator = provider
        .mock("POST", "/llm/chat_complete")
        .with_status(200)
        .with_body(aggregator_reply("low", 0.9))
        .create_async()
        .await;

    let (base, _state) = spawn_service(&worker.url(), &provider.url()).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{base}/analyze_message"))
        .json(&serde_json::json!({"message": "Hello"}))
        .send()
        .await
        .unwrap();

    let body: serde_json::Value = client
        .get(format!("{base}/tasks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tasks = body["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["status"], "completed");
    assert_eq!(tasks[0]["service_name"], "message_analysis");
}
