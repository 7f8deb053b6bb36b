//! Message routing logic for dispatching client messages.
//!
//! A client message names its target as `serverType.category.method`. When
//! the server type is one this gateway serves itself, the handler registered
//! under `category.method` runs in-process against the connection's
//! [`Session`]. Otherwise one live instance of the server type is picked and
//! the message travels there inside an [`Envelope`]; the worker's reply comes
//! back asynchronously through the connection manager's remote intake.

use crate::config::GatewayConfig;
use crate::connection::{Connection, Session};
use crate::error::RoutingError;
use crate::messaging::balancer::LoadBalancer;
use futures::future::BoxFuture;
use meridian_core::{Envelope, Message, MessageType, Route};
use meridian_discovery::InstanceTable;
use meridian_remote::{HandlerError, MessageBus};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace};

pub type LocalHandlerFuture = BoxFuture<'static, Result<serde_json::Value, HandlerError>>;

/// A handler served inside the gateway. Returning `Value::Null` replies with
/// an empty body.
pub type LocalHandler = Arc<dyn Fn(Arc<Session>, Vec<u8>) -> LocalHandlerFuture + Send + Sync>;

/// What became of a routed message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Handled locally; this Response goes straight back to the client
    Reply(Message),
    /// Handled locally with nothing to send (a Notify)
    Handled,
    /// Published to the named process
    Forwarded { dst: String },
}

pub struct Router {
    server_id: String,
    local_types: HashSet<String>,
    handlers: HashMap<String, LocalHandler>,
    instances: Arc<InstanceTable>,
    bus: Arc<dyn MessageBus>,
    balancer: Box<dyn LoadBalancer>,
}

impl Router {
    /// Creates a router for the gateway `server_id`.
    ///
    /// # Arguments
    ///
    /// * `local_types` - Server types whose handlers are registered with [`Router::on`]
    /// * `instances` - Live instances per remote server type, kept current by discovery
    /// * `bus` - Where forwarded envelopes are published
    /// * `balancer` - Picks one instance when a server type has several
    pub fn new(
        server_id: impl Into<String>,
        local_types: impl IntoIterator<Item = impl Into<String>>,
        instances: Arc<InstanceTable>,
        bus: Arc<dyn MessageBus>,
        balancer: Box<dyn LoadBalancer>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            local_types: local_types.into_iter().map(Into::into).collect(),
            handlers: HashMap::new(),
            instances,
            bus,
            balancer,
        }
    }

    /// Creates a router from the gateway's own settings.
    pub fn from_config(
        config: &GatewayConfig,
        instances: Arc<InstanceTable>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self::new(
            config.server_id.clone(),
            config.local_server_types.clone(),
            instances,
            bus,
            config.load_balancer.build(),
        )
    }

    /// Registers a local handler under `key` (`category.method`).
    pub fn on<F, Fut>(&mut self, key: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        let handler: LocalHandler =
            Arc::new(move |session: Arc<Session>, payload: Vec<u8>| -> LocalHandlerFuture {
                Box::pin(handler(session, payload))
            });
        self.handlers.insert(key.into(), handler);
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_local(&self, server_type: &str) -> bool {
        self.local_types.contains(server_type)
    }

    /// Routes one client message on behalf of `connection`.
    pub async fn dispatch(
        &self,
        message: Message,
        connection: &Connection,
    ) -> Result<RouteOutcome, RoutingError> {
        let route = Route::parse(&message.route)?;
        if self.is_local(&route.server_type) {
            self.handle_local(&route, message, connection).await
        } else {
            self.forward(&route, message, connection).await
        }
    }

    async fn handle_local(
        &self,
        route: &Route,
        message: Message,
        connection: &Connection,
    ) -> Result<RouteOutcome, RoutingError> {
        let key = route.handler_key();
        let handler = self
            .handlers
            .get(&key)
            .ok_or_else(|| RoutingError::UnknownHandler(key.clone()))?;

        let value = handler(Arc::clone(connection.session()), message.data.clone()).await?;
        if message.kind != MessageType::Request {
            trace!("Local {} handled without reply", key);
            return Ok(RouteOutcome::Handled);
        }

        let data = if value.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&value)?
        };
        Ok(RouteOutcome::Reply(message.response(data)))
    }

    async fn forward(
        &self,
        route: &Route,
        message: Message,
        connection: &Connection,
    ) -> Result<RouteOutcome, RoutingError> {
        let instances = self
            .instances
            .instances(&route.server_type)
            .ok_or_else(|| RoutingError::NoInstance(route.server_type.clone()))?;
        let dst = self
            .balancer
            .pick(&instances)
            .ok_or_else(|| RoutingError::NoInstance(route.server_type.clone()))?
            .addr
            .clone();

        let session = connection.session();
        let envelope = Envelope {
            src: self.server_id.clone(),
            dst: dst.clone(),
            router: route.handler_key(),
            body: Some(message),
            user_id: session.user_id().await,
            connection_id: connection.id.clone(),
            session_data: session.snapshot().await,
            ..Default::default()
        };

        self.bus.publish(&dst, envelope.to_bytes()?).await?;
        debug!("📤 {} forwarded to {} for {}", route, dst, connection.id);
        Ok(RouteOutcome::Forwarded { dst })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::next_connection_id;
    use crate::messaging::balancer::RoundRobin;
    use futures::StreamExt;
    use meridian_core::OverflowPolicy;
    use meridian_remote::LocalBus;
    use serde_json::json;

    fn connection() -> Connection {
        Connection::new(
            next_connection_id("connector-1"),
            "127.0.0.1:4000".parse().unwrap(),
            8,
            OverflowPolicy::DropOldest,
        )
    }

    fn router(instances: Arc<InstanceTable>, bus: Arc<LocalBus>) -> Router {
        let mut router = Router::new(
            "connector-1",
            ["connector"],
            instances,
            bus,
            Box::new(RoundRobin::default()),
        );
        router.on("echoHandler.echo", |_session, payload: Vec<u8>| async move {
            let value: serde_json::Value = serde_json::from_slice(&payload)?;
            Ok::<_, HandlerError>(json!({ "echo": value }))
        });
        router.on("echoHandler.fail", |_session, _payload| async move {
            Err::<serde_json::Value, _>(HandlerError::Failed("nope".into()))
        });
        router
    }

    #[tokio::test]
    async fn local_request_gets_response_with_same_id() {
        let router = router(Arc::new(InstanceTable::new()), Arc::new(LocalBus::new()));
        let conn = connection();

        let request = Message::request(7, "connector.echoHandler.echo", br#"{"a":1}"#.to_vec());
        let outcome = router.dispatch(request, &conn).await.unwrap();

        let RouteOutcome::Reply(reply) = outcome else {
            panic!("expected a reply, got {outcome:?}");
        };
        assert_eq!(reply.kind, MessageType::Response);
        assert_eq!(reply.id, 7);
        let body: serde_json::Value = serde_json::from_slice(&reply.data).unwrap();
        assert_eq!(body, json!({ "echo": { "a": 1 } }));
    }

    #[tokio::test]
    async fn local_notify_has_no_reply() {
        let router = router(Arc::new(InstanceTable::new()), Arc::new(LocalBus::new()));
        let notify = Message {
            kind: MessageType::Notify,
            route: "connector.echoHandler.echo".into(),
            data: b"1".to_vec(),
            ..Default::default()
        };
        let outcome = router.dispatch(notify, &connection()).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Handled);
    }

    #[tokio::test]
    async fn rejects_bad_routes_and_unknown_handlers() {
        let router = router(Arc::new(InstanceTable::new()), Arc::new(LocalBus::new()));
        let conn = connection();

        let err = router
            .dispatch(Message::request(1, "connector.echo", vec![]), &conn)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::InvalidRoute(_)));

        let err = router
            .dispatch(Message::request(2, "connector.nope.nope", vec![]), &conn)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::UnknownHandler(_)));

        let err = router
            .dispatch(Message::request(3, "connector.echoHandler.fail", vec![]), &conn)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Handler(_)));
    }

    #[tokio::test]
    async fn remote_type_without_instances_fails() {
        let router = router(Arc::new(InstanceTable::new()), Arc::new(LocalBus::new()));
        let err = router
            .dispatch(Message::request(1, "hall.userHandler.info", vec![]), &connection())
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::NoInstance(t) if t == "hall"));
    }

    #[tokio::test]
    async fn forwards_envelope_with_session_snapshot() {
        let table = Arc::new(InstanceTable::from_static([("hall", "hall-1")]));
        let bus = Arc::new(LocalBus::new());
        let mut inbox = bus.subscribe("hall-1").await.unwrap();
        let router = router(table, Arc::clone(&bus));

        let conn = connection();
        conn.session().bind_user("u1").await;
        conn.session().put("room", json!("r1")).await;

        let request = Message::request(11, "hall.userHandler.info", b"{}".to_vec());
        let outcome = router.dispatch(request.clone(), &conn).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Forwarded { dst: "hall-1".into() });

        let envelope = Envelope::from_bytes(&inbox.next().await.unwrap()).unwrap();
        assert_eq!(envelope.src, "connector-1");
        assert_eq!(envelope.dst, "hall-1");
        assert_eq!(envelope.router, "userHandler.info");
        assert_eq!(envelope.user_id, "u1");
        assert_eq!(envelope.connection_id, conn.id);
        assert_eq!(envelope.session_data["room"], json!("r1"));
        assert_eq!(envelope.body, Some(request));
    }
}
