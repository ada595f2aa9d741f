use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::BridgeClient;
use crate::error::BridgeError;
use crate::http::DynHttpTransport;
use crate::http::headers::{api_key_headers, bearer_headers};
use crate::schema::SchemaStore;

/// 模型配置 描述一个可调用端点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 自定义句柄 例如 `default-openai`
    pub handle: String,
    /// 参数映射表中的 provider 名称 例如 `openai`
    pub provider: String,
    /// 完整请求地址 例如 `https://api.openai.com/v1/chat/completions`
    pub endpoint: String,
    pub credential: Credential,
    /// 单次请求超时 留空时沿用会话默认值
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// 附加请求头 例如 `anthropic-version`
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl ModelConfig {
    /// 生成该端点的请求头
    pub fn headers(&self) -> HashMap<String, String> {
        let mut headers = match &self.credential {
            Credential::ApiKey {
                header: Some(header),
                key,
            } => api_key_headers(header, key),
            Credential::ApiKey { header: None, key } => bearer_headers(key, true),
            Credential::Bearer { token } => bearer_headers(token, true),
            Credential::None => {
                HashMap::from([("Content-Type".to_string(), "application/json".to_string())])
            }
        };
        headers.extend(self.extra_headers.clone());
        headers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// 鉴权信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// 简单 API Key
    ApiKey {
        /// header 名称 留空时按 Bearer 发送
        header: Option<String>,
        /// 密钥
        key: String,
    },
    /// Bearer Token
    Bearer { token: String },
    /// 无需鉴权的本地 provider
    None,
}

/// 根据一组模型配置构建 BridgeClient
pub fn build_client_from_configs(
    configs: &[ModelConfig],
    transport: DynHttpTransport,
) -> Result<BridgeClient, BridgeError> {
    let mut builder = BridgeClient::builder().with_transport(transport);

    for config in configs {
        builder = builder.register_handle(config.clone());
    }

    builder.build()
}

/// 校验单个配置 provider 必须存在于 schema 中 endpoint 不能为空
pub(crate) fn check_config(config: &ModelConfig, store: &SchemaStore) -> Result<(), BridgeError> {
    store.provider(&config.provider)?;
    if config.endpoint.trim().is_empty() {
        return Err(BridgeError::validation(format!(
            "handle {} has an empty endpoint",
            config.handle
        )));
    }
    Ok(())
}
