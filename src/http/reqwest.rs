use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::{Client, RequestBuilder, Response};

use crate::error::BridgeError;

use super::{
    DynHttpTransport, HttpBodyReader, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse,
    HttpTransport,
};

const STREAM_CHUNK_SIZE: usize = 8 * 1024;
const STREAM_QUEUE_DEPTH: usize = 16;

/// 基于 reqwest 阻塞客户端的默认 HttpTransport
pub struct ReqwestTransport {
    client: Client,
    stream_client: Client,
}

impl ReqwestTransport {
    /// 使用自定义 reqwest::blocking::Client
    ///
    /// 流式请求也复用该客户端，客户端自身的总超时会限制整条流。
    pub fn new(client: Client) -> Self {
        Self {
            stream_client: client.clone(),
            client,
        }
    }

    /// 替换流式请求使用的客户端
    pub fn with_stream_client(mut self, client: Client) -> Self {
        self.stream_client = client;
        self
    }

    /// 创建默认配置，流式客户端不设总超时
    pub fn default_client() -> Result<Self, BridgeError> {
        let client = Client::builder().build().map_err(client_error)?;
        let stream_client = Client::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(client_error)?;
        Ok(Self::new(client).with_stream_client(stream_client))
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    fn build_request(
        client: &Client,
        mut request: HttpRequest,
    ) -> Result<RequestBuilder, BridgeError> {
        let url = request.url.clone();
        let mut builder = client.request(Self::method(request.method), &request.url);

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        for (name, value) in request.headers.drain() {
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| BridgeError::transport(&url, format!("invalid header name: {err}")))?;
            let header_value = reqwest::header::HeaderValue::from_str(&value).map_err(|err| {
                BridgeError::transport(&url, format!("invalid header value for {header_name}: {err}"))
            })?;
            builder = builder.header(header_name, header_value);
        }

        if let Some(body) = request.body.take() {
            builder = builder.body(body);
        }

        Ok(builder)
    }

    fn headers_to_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

fn client_error(err: reqwest::Error) -> BridgeError {
    BridgeError::transport("", format!("failed to create reqwest client: {err}"))
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> BridgeError {
    if err.is_timeout() {
        BridgeError::transport(url, format!("request timed out: {err}"))
    } else if err.is_connect() {
        BridgeError::transport(url, format!("connection failed: {err}"))
    } else {
        BridgeError::transport(url, err.to_string())
    }
}

/// 流式响应在后台线程与读取方之间传递的消息
enum StreamMessage {
    Head {
        status: u16,
        headers: HashMap<String, String>,
    },
    Failed(BridgeError),
    Chunk(Vec<u8>),
    ReadFailed(io::Error),
}

/// 在后台线程中发送请求并持续读取响应体，读取方丢弃接收端后线程随之退出
fn pump_response(url: String, builder: RequestBuilder, tx: SyncSender<StreamMessage>) {
    let mut response: Response = match builder.send() {
        Ok(response) => response,
        Err(err) => {
            let _ = tx.send(StreamMessage::Failed(map_reqwest_error(&url, err)));
            return;
        }
    };
    let head = StreamMessage::Head {
        status: response.status().as_u16(),
        headers: ReqwestTransport::headers_to_map(response.headers()),
    };
    if tx.send(head).is_err() {
        return;
    }

    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let message = match response.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => StreamMessage::Chunk(buf[..n].to_vec()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => StreamMessage::ReadFailed(err),
        };
        let failed = matches!(message, StreamMessage::ReadFailed(_));
        if tx.send(message).is_err() || failed {
            return;
        }
    }
}

/// 对每次读取施加空闲超时的响应体读取器
///
/// 超时只计算两次数据到达之间的间隔，整条流的总时长不受限制。
struct IdleTimeoutReader {
    rx: Receiver<StreamMessage>,
    idle: Option<Duration>,
    pending: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl IdleTimeoutReader {
    fn new(rx: Receiver<StreamMessage>, idle: Option<Duration>) -> Self {
        Self {
            rx,
            idle,
            pending: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    fn next_message(&self) -> Result<StreamMessage, RecvTimeoutError> {
        match self.idle {
            Some(idle) => self.rx.recv_timeout(idle),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        }
    }
}

impl Read for IdleTimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.pending.len() {
            if self.finished {
                return Ok(0);
            }
            match self.next_message() {
                Ok(StreamMessage::Chunk(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Ok(StreamMessage::ReadFailed(err)) => {
                    self.finished = true;
                    return Err(err);
                }
                // head and handshake failures are consumed before the reader is built
                Ok(StreamMessage::Head { .. } | StreamMessage::Failed(_)) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    return Ok(0);
                }
                Err(RecvTimeoutError::Timeout) => {
                    let idle = self.idle.unwrap_or_default();
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no data received within {idle:?}"),
                    ));
                }
            }
        }

        let available = &self.pending[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
        let url = request.url.clone();
        let response = Self::build_request(&self.client, request)?
            .send()
            .map_err(|err| map_reqwest_error(&url, err))?;
        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let body = response
            .bytes()
            .map_err(|err| map_reqwest_error(&url, err))?
            .to_vec();

        Ok(HttpResponse {
            url,
            status,
            headers,
            body,
        })
    }

    /// 超时作用于等待响应头以及每次等待新数据，而非整条流
    fn send_stream(&self, mut request: HttpRequest) -> Result<HttpStreamResponse, BridgeError> {
        let url = request.url.clone();
        let idle = request.timeout.take();
        let builder = Self::build_request(&self.stream_client, request)?;

        let (tx, rx) = mpsc::sync_channel(STREAM_QUEUE_DEPTH);
        let pump_url = url.clone();
        thread::Builder::new()
            .name("llm-bridge-sse".to_string())
            .spawn(move || pump_response(pump_url, builder, tx))
            .map_err(|err| BridgeError::transport(&url, format!("failed to spawn stream reader: {err}")))?;

        let reader = IdleTimeoutReader::new(rx, idle);
        let (status, headers) = match reader.next_message() {
            Ok(StreamMessage::Head { status, headers }) => (status, headers),
            Ok(StreamMessage::Failed(err)) => return Err(err),
            Ok(StreamMessage::Chunk(_) | StreamMessage::ReadFailed(_))
            | Err(RecvTimeoutError::Disconnected) => {
                return Err(BridgeError::transport(&url, "stream closed before response head"));
            }
            Err(RecvTimeoutError::Timeout) => {
                return Err(BridgeError::transport(
                    &url,
                    format!("request timed out waiting for response head after {:?}", idle.unwrap_or_default()),
                ));
            }
        };
        let body: HttpBodyReader = Box::new(reader);

        Ok(HttpStreamResponse {
            url,
            status,
            headers,
            body,
        })
    }
}

/// 便捷构造线程安全 Transport
pub fn default_dyn_transport() -> Result<DynHttpTransport, BridgeError> {
    Ok(Arc::new(ReqwestTransport::default_client()?))
}
