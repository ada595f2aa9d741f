use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::{ModelConfig, check_config};
use crate::convert::Converter;
use crate::error::{BridgeError, truncate_body};
use crate::http::reqwest::default_dyn_transport;
use crate::http::{DynHttpTransport, HttpBodyReader, HttpMethod};
use crate::request::{Request, RequestOptions};
use crate::response::{ResponseEnvelope, ResponseUnwrap};
use crate::schema::SchemaStore;
use crate::stream::SseStream;

/// 调用入口 负责把通用参数转换后发送到已注册的端点
pub struct BridgeClient {
    models: HashMap<String, ModelConfig>,
    store: Arc<SchemaStore>,
    request: Request,
    unwrap: ResponseUnwrap,
}

impl BridgeClient {
    /// 创建 Builder 便于后续注册端点
    pub fn builder() -> BridgeClientBuilder {
        BridgeClientBuilder {
            models: HashMap::new(),
            transport: None,
            store: None,
            logging: false,
        }
    }

    /// 发送同步聊天请求
    ///
    /// 通用参数经 Converter 转换后 POST 到端点 响应再按 schema 解包
    pub fn chat(
        &self,
        handle: &str,
        kwargs: Map<String, Value>,
    ) -> Result<ResponseEnvelope, BridgeError> {
        let model = self.get_model(handle)?;
        let converter = Converter::with_store(&self.store, &model.provider, kwargs)?;
        let options = Self::options(model, converter.into_payload());

        let response = self.request.send(HttpMethod::Post, &model.endpoint, &options)?;
        if !response.is_success() {
            return Err(BridgeError::HttpStatus {
                status: response.status,
                body: truncate_body(&response.text()),
                url: response.url,
            });
        }
        let body: Value = response.json()?;
        self.unwrap.unwrap(&model.provider, body)
    }

    /// 发起流式聊天请求 `stream` 参数会被强制设为 true
    pub fn stream_chat(
        &self,
        handle: &str,
        mut kwargs: Map<String, Value>,
    ) -> Result<ChatStream, BridgeError> {
        let model = self.get_model(handle)?;
        kwargs.insert("stream".to_string(), Value::Bool(true));
        let converter = Converter::with_store(&self.store, &model.provider, kwargs)?;
        let options = Self::options(model, converter.into_payload());

        let events = self
            .request
            .request_sse(HttpMethod::Post, &model.endpoint, &options)?;
        Ok(ChatStream {
            events,
            provider: model.provider.clone(),
            unwrap: self.unwrap.clone(),
            done: false,
        })
    }

    /// 返回当前已注册的句柄
    pub fn handles(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn model(&self, handle: &str) -> Option<&ModelConfig> {
        self.models.get(handle)
    }

    /// 底层会话 可用于读取请求日志
    pub fn request(&self) -> &Request {
        &self.request
    }

    fn options(model: &ModelConfig, payload: Value) -> RequestOptions {
        let mut options = RequestOptions::json(payload).with_headers(model.headers());
        options.timeout = model.timeout();
        options
    }

    fn get_model(&self, handle: &str) -> Result<&ModelConfig, BridgeError> {
        self.models
            .get(handle)
            .ok_or_else(|| BridgeError::validation(format!("unknown model handle: {handle}")))
    }
}

/// 负责注册端点的 Builder
pub struct BridgeClientBuilder {
    models: HashMap<String, ModelConfig>,
    transport: Option<DynHttpTransport>,
    store: Option<Arc<SchemaStore>>,
    logging: bool,
}

impl BridgeClientBuilder {
    /// 注册一个句柄对应的端点 同名句柄会被覆盖
    pub fn register_handle(mut self, config: ModelConfig) -> Self {
        self.models.insert(config.handle.clone(), config);
        self
    }

    pub fn with_transport(mut self, transport: DynHttpTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 使用指定 schema 默认使用进程级缓存
    pub fn with_store(mut self, store: Arc<SchemaStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// 构建最终的 BridgeClient
    pub fn build(self) -> Result<BridgeClient, BridgeError> {
        let store = match self.store {
            Some(store) => store,
            None => SchemaStore::global()?,
        };
        for config in self.models.values() {
            check_config(config, &store)?;
        }
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_dyn_transport()?,
        };

        Ok(BridgeClient {
            models: self.models,
            unwrap: ResponseUnwrap::new(store.clone()),
            store,
            request: Request::with_transport(transport).enable_logging(self.logging),
        })
    }
}

/// 流式响应 每个事件解包为一个 [`ResponseEnvelope`] 遇到 `[DONE]` 结束
pub struct ChatStream {
    events: SseStream<HttpBodyReader>,
    provider: String,
    unwrap: ResponseUnwrap,
    done: bool,
}

impl Iterator for ChatStream {
    type Item = Result<ResponseEnvelope, BridgeError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let event = match self.events.next()? {
                Ok(event) => event,
                Err(err) => return Some(Err(err)),
            };
            if event.is_done() {
                self.done = true;
                break;
            }
            if event.data.trim().is_empty() {
                continue;
            }
            return Some(
                event
                    .json()
                    .and_then(|chunk| self.unwrap.unwrap(&self.provider, chunk)),
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::config::Credential;
    use crate::http::{HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};
    use crate::schema::ConfigPaths;

    /// 返回固定响应 并记录收到的请求
    struct ScriptedTransport {
        status: u16,
        body: Vec<u8>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn new(status: u16, body: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: body.to_vec(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn sent_payload(&self) -> Value {
            let seen = self.seen.lock().expect("seen lock");
            let body = seen[0].body.as_deref().expect("request body");
            serde_json::from_slice(body).expect("json payload")
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn send(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
            self.seen.lock().expect("seen lock").push(request.clone());
            Ok(HttpResponse {
                url: request.url,
                status: self.status,
                headers: HashMap::new(),
                body: self.body.clone(),
            })
        }

        fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, BridgeError> {
            self.seen.lock().expect("seen lock").push(request.clone());
            Ok(HttpStreamResponse {
                url: request.url,
                status: self.status,
                headers: HashMap::new(),
                body: Box::new(Cursor::new(self.body.clone())),
            })
        }
    }

    fn client(provider: &str, transport: Arc<ScriptedTransport>) -> BridgeClient {
        let store = SchemaStore::load(&ConfigPaths::default()).expect("store");
        BridgeClient::builder()
            .with_store(Arc::new(store))
            .with_transport(transport)
            .enable_logging(true)
            .register_handle(ModelConfig {
                handle: "main".to_string(),
                provider: provider.to_string(),
                endpoint: "http://llm.test/chat".to_string(),
                credential: Credential::Bearer {
                    token: "sk-test".to_string(),
                },
                timeout_secs: Some(20),
                extra_headers: HashMap::new(),
            })
            .build()
            .expect("client")
    }

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn chat_converts_sends_and_unwraps() {
        let transport = ScriptedTransport::new(
            200,
            br#"{"model":"llama3","message":{"role":"assistant","content":"hi there"},"done_reason":"stop"}"#,
        );
        let client = client("ollama", transport.clone());

        let envelope = client
            .chat(
                "main",
                kwargs(json!({
                    "model": "llama3",
                    "messages": [{"role": "user", "content": "hello"}],
                    "max_tokens": 64
                })),
            )
            .expect("chat");

        assert_eq!(envelope.response_text.as_deref(), Some("hi there"));
        assert_eq!(envelope.response_information.expect("metadata")["done_reason"], "stop");

        let payload = transport.sent_payload();
        assert!(payload.get("max_tokens").is_none());
        assert_eq!(payload["stream"], false);

        let seen = transport.seen.lock().expect("seen lock");
        assert_eq!(seen[0].headers["Authorization"], "Bearer sk-test");
        assert_eq!(seen[0].timeout, Some(std::time::Duration::from_secs(20)));
        assert_eq!(client.request().len(), 1);
    }

    #[test]
    fn chat_reports_http_status_errors() {
        let transport = ScriptedTransport::new(429, br#"{"error":"rate limited"}"#);
        let client = client("openai", transport);

        let err = client
            .chat("main", kwargs(json!({"model": "m", "messages": []})))
            .expect_err("status error");
        match err {
            BridgeError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 429);
                assert!(body.contains("rate limited"));
            }
            other => panic!("unexpected error type: {other:?}"),
        }
    }

    #[test]
    fn chat_rejects_unknown_handle() {
        let client = client("openai", ScriptedTransport::new(200, b"{}"));
        let err = client
            .chat("missing", kwargs(json!({"model": "m", "messages": []})))
            .expect_err("should fail");
        match err {
            BridgeError::Validation { message } => {
                assert!(
                    message.contains("missing"),
                    "unexpected validation message: {message}"
                );
            }
            other => panic!("unexpected error type: {other:?}"),
        }
    }

    #[test]
    fn stream_chat_unwraps_chunks_until_done() {
        let body = concat!(
            "data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
            "data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        let transport = ScriptedTransport::new(200, body.as_bytes());
        let client = client("openai", transport.clone());

        let pieces: Vec<String> = client
            .stream_chat(
                "main",
                kwargs(json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]})),
            )
            .expect("stream")
            .map(|chunk| chunk.expect("chunk").response_text.unwrap_or_default())
            .collect();

        assert_eq!(pieces, vec!["Hel".to_string(), "lo".to_string()]);
        assert_eq!(transport.sent_payload()["stream"], true);
    }

    #[test]
    fn normalization_errors_are_raised_before_sending() {
        let transport = ScriptedTransport::new(200, b"{}");
        let client = client("anthropic", transport.clone());

        let err = client
            .chat("main", kwargs(json!({"model": "claude", "messages": []})))
            .expect_err("missing max_tokens");
        assert!(matches!(err, BridgeError::MissingArgument { ref field, .. } if field == "max_tokens"));
        assert!(transport.seen.lock().expect("seen lock").is_empty());
    }
}
