//! 多后端 LLM 请求桥接库
//!
//! 通用参数经 [`convert::Converter`] 按配置表转换为各 provider 的请求体，
//! 由 [`request::Request`] 阻塞发送（支持批量与 SSE），
//! 响应再由 [`response::ResponseUnwrap`] 按路径表解包为统一的 [`ResponseEnvelope`]。

pub mod client;
pub mod config;
pub mod convert;
pub mod error;
pub mod http;
pub mod log;
pub mod pool;
pub mod request;
pub mod response;
pub mod schema;
pub mod stream;
pub mod validate;

pub use client::{BridgeClient, ChatStream};
pub use config::{Credential, ModelConfig, build_client_from_configs};
pub use convert::Converter;
pub use error::BridgeError;
pub use pool::{RequestPool, RequestTask, TaskKind, TaskOutput, TaskResult, partition_batch};
pub use request::{BatchResults, Dispatch, Request, RequestBody, RequestOptions};
pub use response::{ResponseEnvelope, ResponseUnwrap, get_nested_value};
pub use schema::{ConfigPaths, SchemaStore};
pub use stream::{SseDecoder, SseEvent, SseStream};
pub use validate::parse_types;
