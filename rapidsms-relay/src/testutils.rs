use crate::backbone::Backbone;
use crate::config::{ConfigContext, ConfigError, ConfigResolver, RelaySettings};
use crate::correlator::PendingReply;
use crate::errors::BackboneError;
use crate::message::Message;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use url::Url;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Stand-in for the remote system: records every request and answers with a
/// fixed status.
pub struct MockRemote {
    port: u16,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockRemote {
    pub async fn start(status: StatusCode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to address");
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                let recorded = recorded.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = recorded.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();
                            recorded.lock().unwrap().push(RecordedRequest {
                                method: parts.method,
                                path: parts.uri.path().to_string(),
                                headers: parts.headers,
                                body,
                            });

                            let mut response = Response::new(Full::new(Bytes::from_static(b"")));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });

                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        MockRemote { port, requests }
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://127.0.0.1:{}{}", self.port, path)).unwrap()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Polls until `count` requests arrived, for forwards running detached.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<RecordedRequest> {
        for _ in 0..100 {
            let requests = self.requests();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} requests, got {}", self.requests().len());
    }
}

/// Backbone that records sends and can be told to fail or stall per address.
#[derive(Default)]
pub struct MockBackbone {
    sent: Mutex<Vec<Message>>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
}

impl MockBackbone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, to_addr: &str) -> Self {
        self.failing.insert(to_addr.to_string());
        self
    }

    pub fn delayed_for(mut self, to_addr: &str, delay: Duration) -> Self {
        self.delays.insert(to_addr.to_string(), delay);
        self
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    async fn deliver(&self, message: Message) -> Result<Message, BackboneError> {
        if let Some(delay) = self.delays.get(&message.to_addr) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&message.to_addr) {
            return Err(BackboneError::Rejected(message.to_addr));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(message)
    }
}

#[async_trait]
impl Backbone for MockBackbone {
    async fn send_to(
        &self,
        _tag: &str,
        to_addr: &str,
        content: &str,
    ) -> Result<Message, BackboneError> {
        self.deliver(Message::new(to_addr, "1234", content)).await
    }

    async fn reply_to(
        &self,
        original: &PendingReply,
        content: &str,
    ) -> Result<Message, BackboneError> {
        self.deliver(original.reply(content)).await
    }
}

/// Resolves inbound credentials per caller: each known username gets its own
/// password. Unknown callers and anonymous lookups get settings no
/// credentials can satisfy.
pub struct PerUserResolver {
    passwords: HashMap<String, String>,
}

impl PerUserResolver {
    pub fn new(passwords: HashMap<String, String>) -> Self {
        Self { passwords }
    }
}

#[async_trait]
impl ConfigResolver for PerUserResolver {
    async fn resolve(&self, context: &ConfigContext<'_>) -> Result<Arc<RelaySettings>, ConfigError> {
        let known = context
            .username
            .and_then(|username| self.passwords.get_key_value(username));

        let settings = match known {
            Some((username, password)) => RelaySettings {
                vumi_username: Some(username.clone()),
                vumi_password: Some(password.clone()),
                ..Default::default()
            },
            None => RelaySettings {
                vumi_username: Some(String::new()),
                vumi_password: None,
                ..Default::default()
            },
        };
        Ok(Arc::new(settings))
    }
}
