use std::collections::HashMap;
use std::env;

use dotenvy::dotenv;
use llm_bridge::{BridgeClient, Credential, ModelConfig};
use serde_json::{Map, Value, json};

fn load_env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn build_kwargs(model: &str) -> Map<String, Value> {
    let value = json!({
        "model": model,
        "messages": [
            { "role": "system", "content": "You are a helpful assistant." },
            { "role": "user", "content": "Please introduce Rust language in one sentence." }
        ],
        "max_tokens": 128
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!("literal is an object"),
    }
}

#[test]
#[ignore = "requires valid OpenAI-compatible endpoint"]
fn openai_chat_live_sync_and_stream() {
    let _ = dotenv();

    let Some(endpoint) = load_env_var("OPENAI_CHAT_ENDPOINT") else {
        eprintln!("skip live test: OPENAI_CHAT_ENDPOINT missing");
        return;
    };
    let Some(api_key) = load_env_var("OPENAI_CHAT_KEY") else {
        eprintln!("skip live test: OPENAI_CHAT_KEY missing");
        return;
    };
    let Some(model) = load_env_var("OPENAI_CHAT_MODEL") else {
        eprintln!("skip live test: OPENAI_CHAT_MODEL missing");
        return;
    };

    let client = BridgeClient::builder()
        .enable_logging(true)
        .register_handle(ModelConfig {
            handle: "live".to_string(),
            provider: "openai".to_string(),
            endpoint,
            credential: Credential::Bearer { token: api_key },
            timeout_secs: Some(60),
            extra_headers: HashMap::new(),
        })
        .build()
        .expect("client");

    let envelope = client
        .chat("live", build_kwargs(&model))
        .expect("chat request should succeed");
    let text = envelope.response_text.expect("chat response should contain text");
    assert!(!text.trim().is_empty(), "chat text should not be blank");
    assert!(envelope.response_usage.is_some(), "usage should be reported");

    let mut streamed = String::new();
    for chunk in client
        .stream_chat("live", build_kwargs(&model))
        .expect("stream request should succeed")
    {
        let chunk = chunk.expect("stream chunk should decode");
        if let Some(text) = chunk.response_text {
            streamed.push_str(&text);
        }
    }
    assert!(!streamed.trim().is_empty(), "stream should yield text");
    assert_eq!(client.request().len(), 2);
}
