mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::http::StatusCode;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};

use chat_relay::db::ExchangeDirection;
use chat_relay::errors::AppError;
use chat_relay::models::{BackendEvent, Usage, WireMessage, WireRole};

use common::{json_body, sse_payloads, DropFlag, TestGateway};

fn read_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "read",
            "description": "Read a file",
            "parameters": {
                "type": "object",
                "properties": { "path": { "type": "string", "description": "File path" } },
                "required": ["path"]
            }
        }
    })
}

fn delta(text: &str) -> Result<BackendEvent, AppError> {
    Ok(BackendEvent::Delta { content: text.to_string() })
}

fn done(message_id: &str, usage: Option<Usage>) -> Result<BackendEvent, AppError> {
    Ok(BackendEvent::Done { message_id: message_id.to_string(), usage })
}

#[tokio::test]
async fn new_conversation_sends_single_unparented_user_message() {
    let gw = TestGateway::new();
    gw.backend.push_reply("r1", "Hello!");

    let (status, _, body) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "m");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");

    let requests = gw.backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].chat_id, "chat-0");
    assert_eq!(
        requests[0].messages,
        [WireMessage { role: WireRole::User, content: "hi".into(), parent_ref: None }]
    );
    assert_eq!(gw.store.len(), 1);
}

#[tokio::test]
async fn continuation_sends_only_newest_message_chained_to_parent() {
    let gw = TestGateway::new();
    gw.backend.push_reply("r1", "Hello!");
    gw.backend.push_reply("r2", "More.");

    let first = json!([
        {"role": "system", "content": "Be terse."},
        {"role": "user", "content": "hi"}
    ]);
    let (status, _, _) =
        gw.post_json("/v1/chat/completions", json!({"messages": first})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "Hello!"},
                {"role": "user", "content": "more"}
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["choices"][0]["message"]["content"], "More.");

    let requests = gw.backend.requests();
    assert_eq!(requests[0].messages.len(), 2);
    assert_eq!(requests[0].messages[0].role, WireRole::System);
    assert_eq!(
        requests[1].messages,
        [WireMessage {
            role: WireRole::User,
            content: "more".into(),
            parent_ref: Some("r1".into()),
        }]
    );
    assert_eq!(requests[1].chat_id, requests[0].chat_id);
    assert_eq!(gw.backend.chats_created(), 1);
}

#[tokio::test]
async fn missing_model_falls_back_to_first_configured() {
    let gw = TestGateway::new();
    gw.backend.push_reply("r1", "ok");

    let (_, _, body) = gw
        .post_json("/v1/chat/completions", json!({"messages": [{"role": "user", "content": "hi"}]}))
        .await;
    assert_eq!(json_body(&body)["model"], "relay-1");
    assert_eq!(gw.backend.requests()[0].model, "relay-1");
}

#[tokio::test]
async fn streamed_tool_call_split_across_chunks() {
    let gw = TestGateway::new();
    let usage = Usage { prompt_tokens: 5, completion_tokens: 7, total_tokens: 12 };
    gw.backend.push_stream(vec![
        delta("ok "),
        delta("<read><path>a.txt</"),
        delta("path></read>"),
        done("r1", Some(usage)),
    ]);

    let (status, content_type, body) = gw
        .post_json(
            "/v1/chat/completions",
            json!({
                "model": "m",
                "stream": true,
                "tools": [read_tool()],
                "messages": [{"role": "user", "content": "show a.txt"}]
            }),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("text/event-stream"));

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    let chunks: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    assert_eq!(chunks.len(), 5);

    assert_eq!(chunks[0]["object"], "chat.completion.chunk");
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "ok");

    let start = &chunks[1]["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(start["index"], 0);
    assert_eq!(start["type"], "function");
    assert_eq!(start["function"]["name"], "read");
    assert_eq!(start["function"]["arguments"], "");
    assert!(start["id"].as_str().unwrap().starts_with("call_"));

    let args = chunks[2]["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"]
        .as_str()
        .unwrap();
    assert_eq!(serde_json::from_str::<Value>(args).unwrap(), json!({"path": "a.txt"}));

    assert_eq!(chunks[3]["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(chunks[4]["choices"], json!([]));
    assert_eq!(chunks[4]["usage"]["total_tokens"], 12);

    let ids: Vec<&Value> = chunks.iter().map(|c| &c["id"]).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));

    let system = &gw.backend.requests()[0].messages[0];
    assert_eq!(system.role, WireRole::System);
    assert!(system.content.contains("<read>"));
}

#[tokio::test]
async fn unknown_tag_is_plain_content() {
    let gw = TestGateway::new();
    gw.backend.push_reply("r1", "<notatool>x</notatool>");

    let (_, _, body) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"tools": [read_tool()], "messages": [{"role": "user", "content": "go"}]}),
        )
        .await;
    let body = json_body(&body);
    assert_eq!(body["choices"][0]["message"]["content"], "<notatool>x</notatool>");
    assert!(body["choices"][0]["message"].get("tool_calls").map_or(true, Value::is_null));
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn tool_result_continuation_restates_result_as_user_turn() {
    let gw = TestGateway::new();
    gw.backend.push_reply("r1", "Checking. <read><path>a.txt</path></read>");
    gw.backend.push_reply("r2", "It says hello.");

    let user = json!({"role": "user", "content": "what is in a.txt?"});
    let (_, _, body) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"tools": [read_tool()], "messages": [user.clone()]}),
        )
        .await;
    let body = json_body(&body);
    let message = body["choices"][0]["message"].clone();
    assert_eq!(message["content"], "Checking.");
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    let call_id = message["tool_calls"][0]["id"].as_str().unwrap().to_string();

    let (status, _, body) = gw
        .post_json(
            "/v1/chat/completions",
            json!({
                "tools": [read_tool()],
                "messages": [
                    user,
                    message,
                    {"role": "tool", "tool_call_id": call_id, "content": "hello"}
                ]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["choices"][0]["message"]["content"], "It says hello.");

    let requests = gw.backend.requests();
    assert_eq!(
        requests[1].messages,
        [WireMessage {
            role: WireRole::User,
            content: format!("Result of `read` (call `{call_id}`): hello"),
            parent_ref: Some("r1".into()),
        }]
    );
}

#[tokio::test]
async fn unknown_continuation_is_not_found() {
    let gw = TestGateway::new();

    let (status, _, body) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "never said this"},
                {"role": "user", "content": "more"}
            ]}),
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["code"], "session_not_found");
    assert!(gw.backend.requests().is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let gw = TestGateway::new();

    let (status, _, body) =
        gw.post_json("/v1/chat/completions", json!({"model": "m", "messages": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["error"]["code"], "invalid_request");

    let (status, _, _) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"messages": [{"role": "wizard", "content": "x"}]}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = gw
        .post_json(
            "/v1/chat/completions",
            json!({
                "tools": [{"type": "function", "function": {"name": "bad name"}}],
                "messages": [{"role": "user", "content": "x"}]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(gw.backend.chats_created(), 0);
}

#[tokio::test]
async fn transient_backend_failure_is_retried() {
    let gw = TestGateway::new();
    gw.backend.push_failure(AppError::BackendUnavailable { message: "502".into() });
    gw.backend.push_reply("r1", "recovered");

    let (status, _, body) = gw
        .post_json("/v1/chat/completions", json!({"messages": [{"role": "user", "content": "hi"}]}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["choices"][0]["message"]["content"], "recovered");
    assert_eq!(gw.backend.requests().len(), 2);
}

#[tokio::test]
async fn rejected_backend_request_is_not_retried() {
    let gw = TestGateway::new();
    gw.backend.push_failure(AppError::BackendRejected { status: 400, message: "nope".into() });

    let (status, _, body) = gw
        .post_json("/v1/chat/completions", json!({"messages": [{"role": "user", "content": "hi"}]}))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json_body(&body)["error"]["code"], "backend_rejected");
    assert_eq!(gw.backend.requests().len(), 1);
}

#[tokio::test]
async fn mid_stream_failure_ends_with_error_frame_and_no_commit() {
    let gw = TestGateway::new();
    gw.backend.push_stream(vec![
        delta("partial"),
        Err(AppError::BackendTimeout { message: "read timed out".into() }),
    ]);

    let (status, _, body) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 3);
    let first: Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], "partial");
    let error: Value = serde_json::from_str(&payloads[1]).unwrap();
    assert_eq!(error["error"]["code"], "backend_timeout");
    assert_eq!(payloads[2], "[DONE]");

    // The exchange never completed, so the history cannot be resumed.
    let (status, _, _) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "partial"},
                {"role": "user", "content": "again"}
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stream_without_completion_frame_is_a_failure() {
    let gw = TestGateway::new();
    gw.backend.push_stream(vec![delta("cut off")]);

    let (_, _, body) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    let payloads = sse_payloads(&body);
    let error: Value = serde_json::from_str(&payloads[payloads.len() - 2]).unwrap();
    assert_eq!(error["error"]["code"], "backend_protocol_error");
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn client_disconnect_releases_backend_stream_without_commit() {
    let gw = TestGateway::new();
    let (guard, released) = DropFlag::new();
    let events = stream::iter(vec![delta("hello")])
        .chain(stream::pending())
        .map(move |event| {
            let _held = &guard;
            event
        })
        .boxed();
    gw.backend.push_event_stream(events);

    let (status, body) = gw
        .open_stream(
            "/v1/chat/completions",
            json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let mut frames = body.into_data_stream();
    let first = frames.next().await.unwrap().unwrap();
    assert!(std::str::from_utf8(&first).unwrap().contains("hello"));
    drop(frames);

    for _ in 0..100 {
        if released.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released.load(Ordering::SeqCst), "backend stream still held after disconnect");

    let (status, _, _) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "more"}
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn streamed_exchange_can_be_continued() {
    let gw = TestGateway::new();
    gw.backend.push_stream(vec![delta("  Hel"), delta("lo! "), done("r1", None)]);
    gw.backend.push_reply("r2", "Sure.");

    let (_, _, body) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    let text: String = sse_payloads(&body)
        .iter()
        .filter(|p| p.as_str() != "[DONE]")
        .filter_map(|p| {
            let chunk: Value = serde_json::from_str(p).unwrap();
            chunk["choices"][0]["delta"]["content"].as_str().map(str::to_string)
        })
        .collect();
    assert_eq!(text, "Hello!");

    let (status, _, _) = gw
        .post_json(
            "/v1/chat/completions",
            json!({"messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": text},
                {"role": "user", "content": "and then?"}
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gw.backend.requests()[1].messages[0].parent_ref.as_deref(), Some("r1"));
}

#[tokio::test]
async fn exchanges_are_audited() {
    let gw = TestGateway::new();
    gw.backend.push_reply("r1", "Hello!");

    gw.post_json("/v1/chat/completions", json!({"messages": [{"role": "user", "content": "hi"}]}))
        .await;

    let records = gw.exchange_log.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].direction, ExchangeDirection::Request);
    assert_eq!(records[0].payload["messages"][0]["content"], "hi");
    assert_eq!(records[1].direction, ExchangeDirection::Response);
    assert_eq!(records[1].session_id, records[0].session_id);
}

#[tokio::test]
async fn models_and_health() {
    let gw = TestGateway::new();

    let (status, _, body) = gw.get("/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "relay-1");

    let (status, _, body) = gw.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({"status": "ok"}));
}
