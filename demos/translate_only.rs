//! Use the codecs and the stream re-framer without a server.
//!
//! Usage:
//!   `cargo run --example translate_only`

use dialect_gateway::schema::{Message, Reasoning, Request, Role};
use dialect_gateway::translate::streaming::Reframer;
use dialect_gateway::translate::{self, Dialect, SseFrame};
use serde_json::json;

fn main() {
    let mut req = Request::new(
        "claude-3-5-sonnet",
        1024,
        vec![
            Message::text(Role::User, "What is the capital of France?"),
            Message::text(Role::Assistant, "The capital of France is Paris."),
            Message::text(Role::User, "And Germany?"),
        ],
    );
    req.system = Some("You are a geography expert. Be concise.".to_string());
    req.reasoning = Some(Reasoning::Budget(6000));
    req.stream = true;

    println!("=== Anthropic request ===");
    println!("{}", String::from_utf8_lossy(&translate::encode_request(Dialect::Anthropic, &req)));
    println!();
    println!("=== Same request, OpenAI shape ===");
    println!("{}", String::from_utf8_lossy(&translate::encode_request(Dialect::OpenAi, &req)));
    println!();

    // An OpenAI stream re-framed for an Anthropic client.
    let chunk = |delta: serde_json::Value, finish: Option<&str>| {
        SseFrame::data(
            json!({"id": "chatcmpl-demo", "model": "gpt-4o",
                   "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]})
            .to_string(),
        )
    };
    let upstream = vec![
        chunk(json!({"role": "assistant", "content": ""}), None),
        chunk(json!({"content": "The capital of Germany"}), None),
        chunk(json!({"content": " is Berlin."}), None),
        chunk(json!({}), Some("stop")),
        SseFrame::data(
            json!({"id": "chatcmpl-demo", "model": "gpt-4o", "choices": [],
                   "usage": {"prompt_tokens": 31, "completion_tokens": 9, "total_tokens": 40}})
            .to_string(),
        ),
        SseFrame::data("[DONE]"),
    ];

    println!("=== Re-framed stream (Anthropic SSE) ===");
    let mut reframer = Reframer::new(Dialect::OpenAi, Dialect::Anthropic, Some(req.model.clone()));
    for frame in &upstream {
        for out in reframer.push_frame(frame) {
            print!("{}", String::from_utf8_lossy(&out.to_bytes()));
        }
    }
    for out in reframer.finish() {
        print!("{}", String::from_utf8_lossy(&out.to_bytes()));
    }
}
