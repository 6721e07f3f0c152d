use crate::api::RelayHttpService;
use crate::auth::AuthGateway;
use crate::backbone::Backbone;
use crate::config::{Config, ConfigContext, ConfigResolver};
use crate::correlator::{MemoryStore, RedisStore, ReplyCorrelator, ReplyStore};
use crate::dispatcher::InboundDispatcher;
use crate::errors::{RelayError, Result};
use crate::forwarder::RemoteForwarder;
use crate::message::{BackboneEvent, Event, EventType, Message};
use shared::http::run_http_service;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServiceState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        }
    }
}

struct Lifecycle {
    state: ServiceState,
    correlator: Option<ReplyCorrelator>,
    shutdown: Option<oneshot::Sender<()>>,
    listener_task: Option<JoinHandle<Result<()>>>,
    local_addr: Option<SocketAddr>,
}

struct Started {
    correlator: Option<ReplyCorrelator>,
    shutdown: oneshot::Sender<()>,
    listener_task: JoinHandle<Result<()>>,
    local_addr: SocketAddr,
}

/// The relay: owns the HTTP resources and the reply store, and is the entry
/// point for everything the backbone delivers.
#[derive(Clone)]
pub struct RelayService {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    resolver: Arc<dyn ConfigResolver>,
    backbone: Arc<dyn Backbone>,
    forwarder: RemoteForwarder,
    /// Used instead of redis or the in-memory store when set.
    reply_store: Option<Arc<dyn ReplyStore>>,
    lifecycle: Mutex<Lifecycle>,
}

impl RelayService {
    pub fn new(
        config: Config,
        resolver: Arc<dyn ConfigResolver>,
        backbone: Arc<dyn Backbone>,
    ) -> Self {
        Self::build(config, resolver, backbone, None)
    }

    /// Like [`RelayService::new`], but pending replies are kept in `store`
    /// whenever replies are enabled. The store is closed on [`RelayService::stop`].
    pub fn with_reply_store(
        config: Config,
        resolver: Arc<dyn ConfigResolver>,
        backbone: Arc<dyn Backbone>,
        store: Arc<dyn ReplyStore>,
    ) -> Self {
        Self::build(config, resolver, backbone, Some(store))
    }

    fn build(
        config: Config,
        resolver: Arc<dyn ConfigResolver>,
        backbone: Arc<dyn Backbone>,
        reply_store: Option<Arc<dyn ReplyStore>>,
    ) -> Self {
        let forwarder = RemoteForwarder::new(resolver.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                resolver,
                backbone,
                forwarder,
                reply_store,
                lifecycle: Mutex::new(Lifecycle {
                    state: ServiceState::Stopped,
                    correlator: None,
                    shutdown: None,
                    listener_task: None,
                    local_addr: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle().state
    }

    /// Address the HTTP listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle().local_addr
    }

    /// Binds `web_host:web_port` and starts serving.
    pub async fn start(&self) -> Result<SocketAddr> {
        let config = &self.inner.config;
        config.validate()?;
        let listener = TcpListener::bind((config.web_host.as_str(), config.web_port)).await?;
        self.start_with_listener(listener).await
    }

    /// Starts serving on an already bound listener.
    pub async fn start_with_listener(&self, listener: TcpListener) -> Result<SocketAddr> {
        self.transition(ServiceState::Stopped, ServiceState::Starting)?;

        match self.bring_up(listener).await {
            Ok(started) => {
                let mut lifecycle = self.lifecycle();
                lifecycle.state = ServiceState::Running;
                lifecycle.correlator = started.correlator;
                lifecycle.shutdown = Some(started.shutdown);
                lifecycle.listener_task = Some(started.listener_task);
                lifecycle.local_addr = Some(started.local_addr);
                tracing::info!(addr = %started.local_addr, "relay running");
                Ok(started.local_addr)
            }
            Err(e) => {
                self.lifecycle().state = ServiceState::Stopped;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, listener: TcpListener) -> Result<Started> {
        let config = &self.inner.config;
        config.validate()?;

        let correlator = match config.allow_replies {
            true => {
                let store: Arc<dyn ReplyStore> = match (&self.inner.reply_store, &config.redis_manager) {
                    (Some(store), _) => store.clone(),
                    (None, Some(redis)) => Arc::new(RedisStore::connect(redis).await?),
                    (None, None) => {
                        tracing::warn!("no redis_manager configured, keeping pending replies in memory");
                        Arc::new(MemoryStore::new())
                    }
                };
                Some(ReplyCorrelator::new(store))
            }
            false => None,
        };

        let http_service = RelayHttpService::new(
            &config.web_path,
            AuthGateway::new(self.inner.resolver.clone()),
            InboundDispatcher::new(self.inner.backbone.clone(), correlator.clone()),
        );

        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let listener_task = tokio::spawn(run_http_service(listener, http_service, async move {
            let _ = shutdown_rx.await;
        }));

        Ok(Started {
            correlator,
            shutdown,
            listener_task,
            local_addr,
        })
    }

    /// Stops accepting HTTP requests, then releases the reply store.
    ///
    /// Open connections are drained first: requests in progress complete and
    /// idle keep-alive connections are closed. Forwards already in flight are
    /// left to finish on their own. Stopping a stopped service is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (shutdown, listener_task, correlator) = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                ServiceState::Stopped => return Ok(()),
                ServiceState::Running => {}
                other => return Err(RelayError::InvalidState(other.as_str(), "running")),
            }
            lifecycle.state = ServiceState::Stopping;
            lifecycle.local_addr = None;
            (
                lifecycle.shutdown.take(),
                lifecycle.listener_task.take(),
                lifecycle.correlator.take(),
            )
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        let listener_result = match listener_task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(RelayError::ListenerTask(e.to_string())),
            },
            None => Ok(()),
        };

        // Only now that no connection can reach the dispatcher
        if let Some(correlator) = correlator {
            correlator.close().await;
        }

        self.lifecycle().state = ServiceState::Stopped;
        tracing::info!("relay stopped");
        listener_result
    }

    /// Routes one delivery from the backbone to its handler.
    pub fn consume(&self, event: BackboneEvent) -> Option<JoinHandle<()>> {
        match event {
            BackboneEvent::UserMessage(message) if message.is_session_close() => {
                self.on_session_close(message)
            }
            BackboneEvent::UserMessage(message) => self.on_inbound_message(message),
            BackboneEvent::Event(event) => {
                match event.event_type {
                    EventType::Ack => self.on_ack(&event),
                    EventType::Nack => self.on_nack(&event),
                    EventType::DeliveryReport => self.on_delivery_report(&event),
                }
                None
            }
        }
    }

    /// Consumes deliveries until the backbone side of the channel closes, then
    /// waits for the forwards it started.
    pub async fn run_consumer(&self, mut deliveries: mpsc::Receiver<BackboneEvent>) {
        let mut forwards: Vec<JoinHandle<()>> = Vec::new();
        while let Some(event) = deliveries.recv().await {
            forwards.retain(|forward| !forward.is_finished());
            forwards.extend(self.consume(event));
        }

        tracing::info!(pending = forwards.len(), "backbone delivery channel closed");
        for forward in forwards {
            if let Err(e) = forward.await {
                tracing::error!(error = %e, "forward task failed");
            }
        }
    }

    /// Forwards an inbound message to the remote system on a detached task,
    /// remembering it first when replies are enabled.
    pub fn on_inbound_message(&self, message: Message) -> Option<JoinHandle<()>> {
        let correlator = self.running_correlator(&message)?;
        let inner = self.inner.clone();

        Some(tokio::spawn(async move {
            if let Some(correlator) = correlator {
                remember(&inner, &correlator, &message).await;
            }
            inner.forwarder.forward_and_log(&message).await;
        }))
    }

    /// Session closes are relayed exactly like inbound messages, but cannot be
    /// replied to.
    pub fn on_session_close(&self, message: Message) -> Option<JoinHandle<()>> {
        self.running_correlator(&message)?;
        let inner = self.inner.clone();

        Some(tokio::spawn(async move {
            inner.forwarder.forward_and_log(&message).await;
        }))
    }

    pub fn on_ack(&self, event: &Event) {
        tracing::info!(
            user_message_id = %event.user_message_id,
            "Acknowledgement received for message"
        );
    }

    pub fn on_nack(&self, event: &Event) {
        tracing::info!(
            user_message_id = %event.user_message_id,
            reason = event.nack_reason.as_deref().unwrap_or("unknown"),
            "Negative acknowledgement received for message"
        );
    }

    pub fn on_delivery_report(&self, event: &Event) {
        tracing::info!(
            user_message_id = %event.user_message_id,
            status = ?event.delivery_status,
            "Delivery report received for message"
        );
    }

    /// `None` when not running; otherwise the correlator, if replies are on.
    fn running_correlator(&self, message: &Message) -> Option<Option<ReplyCorrelator>> {
        let lifecycle = self.lifecycle();
        if lifecycle.state != ServiceState::Running {
            tracing::warn!(
                message_id = %message.message_id,
                state = lifecycle.state.as_str(),
                "relay is not running, dropping message"
            );
            return None;
        }
        Some(lifecycle.correlator.clone())
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != from {
            return Err(RelayError::InvalidState(
                lifecycle.state.as_str(),
                from.as_str(),
            ));
        }
        lifecycle.state = to;
        Ok(())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        // The lifecycle is only touched in short, non-panicking sections
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn remember(inner: &Inner, correlator: &ReplyCorrelator, message: &Message) {
    let ttl = match inner
        .resolver
        .resolve(&ConfigContext::for_message(message))
        .await
    {
        Ok(settings) => settings.reply_timeout(),
        Err(e) => {
            tracing::error!(message_id = %message.message_id, error = %e, "cannot resolve reply timeout");
            return;
        }
    };

    if let Err(e) = correlator.remember(message, ttl).await {
        tracing::error!(
            message_id = %message.message_id,
            error = %e,
            "failed to store message for replies"
        );
    }
}
