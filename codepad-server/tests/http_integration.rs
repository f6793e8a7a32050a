//! End-to-end tests for the HTTP front end.
//!
//! Each test starts a full app on free ports with an in-memory store and
//! a scripted toolchain, then talks to it over real sockets.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;

use codepad_core::Diagnostic;
use codepad_eval::{
    Artifact, Compilation, EngineConfig, EvaluationEngine, Limits, RunOutput, Source, Toolchain,
    ToolchainError,
};
use codepad_live::{HttpValidator, Validator};
use codepad_server::{App, AppConfig, Running};
use codepad_store::MemoryStore;

/// `= ;` is the only syntax error this compiler knows.
struct Strict;

#[async_trait]
impl Toolchain for Strict {
    async fn compile(&self, source: &Source) -> Result<Compilation, ToolchainError> {
        if source.command.contains("= ;") {
            return Ok(Compilation::failure(vec![Diagnostic::new(
                "Invalid expression term ';'",
            )
            .at(1, 9)
            .with_code("CS1525")]));
        }
        Ok(Compilation::success(Artifact::detached(source.clone())))
    }

    async fn run(&self, _artifact: Artifact, _limits: Limits) -> Result<RunOutput, ToolchainError> {
        Ok(RunOutput::default())
    }
}

async fn start() -> Running {
    let mut config = AppConfig::default();
    config.http.bind_addr = "127.0.0.1:0".to_string();
    config.http.workers = 2;
    config.live.bind_addr = "127.0.0.1:0".to_string();
    config.import.timeout_ms = 2_000;
    config.import.allowed_hosts.push("127.0.0.1".to_string());

    let engine = EvaluationEngine::new(Arc::new(Strict), &EngineConfig::for_testing());
    App::with_parts(config, Arc::new(MemoryStore::new()), Arc::new(engine))
        .start()
        .await
        .unwrap()
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn location(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Serve `body` for every request on a free port until the test ends.
fn serve_text(body: &'static str) -> String {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    thread::spawn(move || {
        for request in server.incoming_requests() {
            let _ = request.respond(tiny_http::Response::from_string(body));
        }
    });
    format!("http://{addr}/Person.cs")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_fetch_and_versions() {
    let app = start().await;
    let base = format!("http://{}", app.http_addr());
    let client = client();

    let response = client
        .post(format!("{base}/save"))
        .json(&json!({ "slug": "greet", "content": "return 1+1;", "classes": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 302);
    assert_eq!(location(&response).as_deref(), Some("/greet"));

    let response = client
        .post(format!("{base}/greet"))
        .json(&json!({ "content": "int x = ;" }))
        .send()
        .await
        .unwrap();
    assert_eq!(location(&response).as_deref(), Some("/greet/2"));

    let first: Value = client.get(format!("{base}/greet")).send().await.unwrap().json().await.unwrap();
    assert_eq!(first["post"]["version"], 1);
    assert_eq!(first["post"]["content"], "return 1+1;");
    assert_eq!(first["messages"], json!(["Build completed successfully."]));

    let second: Value = client.get(format!("{base}/greet/2")).send().await.unwrap().json().await.unwrap();
    assert_eq!(second["post"]["version"], 2);
    assert_eq!(second["diagnostics"][0]["code"], "CS1525");

    let latest = client.get(format!("{base}/greet/latest")).send().await.unwrap();
    assert_eq!(latest.status().as_u16(), 302);
    assert_eq!(location(&latest).as_deref(), Some("/greet/2"));

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redirects_and_not_found() {
    let app = start().await;
    let base = format!("http://{}", app.http_addr());
    let client = client();

    let response = client.get(format!("{base}/greet/1")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 301);
    assert_eq!(location(&response).as_deref(), Some("/greet"));

    let response = client.get(format!("{base}/greet/7")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 404);
    assert_eq!(
        response.headers().get(reqwest::header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "code snippet of 'greet' ver. 7 was not found.");

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_body_rejected() {
    let app = start().await;
    let base = format!("http://{}", app.http_addr());

    let content = "x".repeat(AppConfig::default().http.max_body_bytes + 1);
    let response = client()
        .post(format!("{base}/save"))
        .json(&json!({ "content": content }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 413);

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_validator_against_endpoint() {
    let app = start().await;
    let validator = HttpValidator::new(format!("http://{}/validate", app.http_addr()));

    let diagnostics = validator.validate("int x = ;", "").await.unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].location.map(|l| (l.line, l.column)), Some((1, 9)));

    assert!(validator.validate("return 1;", "").await.unwrap().is_empty());

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_import_success_and_failure() {
    let app = start().await;
    let base = format!("http://{}", app.http_addr());
    let client = client();
    let remote = serve_text("public class Person {}");

    let imported: Value = client
        .get(format!("{base}/import"))
        .query(&[("address", remote.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(imported["draft"]["classes"], "public class Person {}");
    assert_eq!(imported["draft"]["content"], "");

    let failed = client
        .get(format!("{base}/import"))
        .query(&[("address", "http://127.0.0.1:1/gone.cs")])
        .send()
        .await
        .unwrap();
    assert_eq!(failed.status().as_u16(), 200);
    let failed: Value = failed.json().await.unwrap();
    assert_eq!(failed["draft"], json!({ "content": "", "classes": "" }));

    // an unlisted host is never contacted; the sample comes back instead
    let refused: Value = client
        .get(format!("{base}/import"))
        .query(&[("address", remote.replace("127.0.0.1", "localhost").as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(refused["draft"]["classes"].as_str().unwrap().contains("interface IPerson"));

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_index_serves_sample() {
    let app = start().await;
    let body: Value = client()
        .get(format!("http://{}/", app.http_addr()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["draft"]["classes"].as_str().unwrap().contains("interface IPerson"));
    assert_eq!(body["diagnostics"], json!([]));

    app.shutdown().await;
}
