//! Per-connection MQTT session loop.
//!
//! The read side runs the packet loop and calls into the authorization bridge;
//! every frame headed to the client, whether an ack or a routed publish, goes
//! through one writer task so the loop never blocks on a slow socket.

use super::protocol::{
    read_connect, read_packet, write_connack, write_pingresp, write_puback, write_pubcomp,
    write_pubrec, write_suback, write_unsuback, ConnectPacket, ConnectRead, ConnectReturnCode,
    ControlPacket, PublishPacket, Qos, SubAckResult, SubscribePacket, UnsubscribePacket,
};
use super::router::{Outbound, Router};
use super::topics::{validate_topic_filter, validate_topic_name};
use crate::authz::{AuthorizationBridge, AuthzError, ConnectionId, Credentials};
use anyhow::{anyhow, bail, Result};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// A client must send CONNECT within this window after the socket is accepted.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 256;

/// Shared state every connection task needs.
#[derive(Clone)]
pub struct BrokerCtx {
    pub bridge: AuthorizationBridge,
    pub router: Arc<Router>,
}

impl BrokerCtx {
    pub fn new(bridge: AuthorizationBridge, router: Arc<Router>) -> Self {
        Self { bridge, router }
    }
}

enum SessionAction {
    Continue,
    Disconnect,
}

/// Drive one client connection from CONNECT to close.
pub async fn handle_connection<S>(stream: S, ctx: BrokerCtx) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = ConnectionId::generate();
    let (mut reader, mut writer) = tokio::io::split(stream);

    let connect = match tokio::time::timeout(CONNECT_TIMEOUT, read_connect(&mut reader)).await {
        Ok(Ok(ConnectRead::Packet(connect))) => connect,
        Ok(Ok(ConnectRead::UnsupportedLevel(level))) => {
            tracing::warn!(connection = %connection, level, "refusing unsupported protocol level");
            write_connack(&mut writer, false, ConnectReturnCode::UnacceptableProtocolVersion)
                .await?;
            return Ok(());
        }
        Ok(Err(err)) => {
            ctx.bridge
                .on_connection_error(Some(&connection), &format!("{err:#}"));
            return Err(err);
        }
        Err(_) => {
            ctx.bridge
                .on_connection_error(Some(&connection), "no CONNECT received in time");
            return Ok(());
        }
    };

    if let Err(err) = authenticate(&ctx, &connection, &connect).await {
        tracing::debug!(
            connection = %connection,
            reason = err.label(),
            retryable = err.is_retryable(),
            "connect refused"
        );
        ctx.bridge.discard(&connection);
        write_connack(&mut writer, false, connack_code(&err)).await?;
        return Ok(());
    }
    // The client may have hung up while the connect check was running.
    if let Err(err) = write_connack(&mut writer, false, ConnectReturnCode::Accepted).await {
        ctx.bridge.discard(&connection);
        ctx.bridge
            .on_connection_error(Some(&connection), &format!("{err:#}"));
        return Err(err);
    }
    ctx.bridge.on_connected(&connection);

    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    ctx.router.register(&connection, outbound.clone());
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx));

    let result = process_packets(&mut reader, &ctx, &connection, connect.keep_alive, &outbound).await;

    ctx.router.remove(&connection);
    drop(outbound);
    if let Err(err) = &result {
        ctx.bridge.on_client_error(&connection, &format!("{err:#}"));
    }
    ctx.bridge.on_disconnected(&connection);
    match tokio::time::timeout(Duration::from_secs(1), writer_task).await {
        Ok(Ok(Err(err))) => tracing::debug!(connection = %connection, "writer closed with error: {err:#}"),
        Ok(_) => {}
        Err(_) => tracing::debug!(connection = %connection, "writer did not drain in time"),
    }
    result
}

async fn authenticate(
    ctx: &BrokerCtx,
    connection: &ConnectionId,
    connect: &ConnectPacket,
) -> Result<(), AuthzError> {
    tracing::debug!(
        connection = %connection,
        client_id = %connect.client_id,
        protocol = ?connect.protocol,
        clean_session = connect.clean_session,
        "CONNECT received"
    );
    let credentials = Credentials {
        username: connect.username.clone(),
        password: connect.password.clone(),
    };
    ctx.bridge.authenticate(connection, credentials).await
}

fn connack_code(err: &AuthzError) -> ConnectReturnCode {
    match err {
        AuthzError::MalformedCredentials(_) | AuthzError::RemoteRejection { .. } => {
            ConnectReturnCode::BadUsernameOrPassword
        }
        AuthzError::RemoteUnreachable { .. } => ConnectReturnCode::ServerUnavailable,
        AuthzError::ProtocolMisuse { .. } => ConnectReturnCode::NotAuthorized,
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Vec<u8>>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn process_packets<R>(
    reader: &mut R,
    ctx: &BrokerCtx,
    connection: &ConnectionId,
    keep_alive: u16,
    outbound: &Outbound,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    // 1.5x the negotiated interval; zero disables the check.
    let window = (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500));
    loop {
        let next = match window {
            Some(window) => match tokio::time::timeout(window, read_packet(reader)).await {
                Ok(res) => res,
                Err(_) => bail!("keep-alive timeout"),
            },
            None => read_packet(reader).await,
        };
        let packet = match next {
            Ok(packet) => packet,
            Err(err) if is_closed(&err) => {
                tracing::debug!(connection = %connection, "client closed the connection");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        match handle_incoming(ctx, connection, packet, outbound).await? {
            SessionAction::Continue => {}
            SessionAction::Disconnect => return Ok(()),
        }
    }
}

fn is_closed(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some_and(|e| {
            matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            )
        })
    })
}

async fn handle_incoming(
    ctx: &BrokerCtx,
    connection: &ConnectionId,
    packet: ControlPacket,
    outbound: &Outbound,
) -> Result<SessionAction> {
    let mut frame = Vec::new();
    match packet {
        ControlPacket::Publish(publish) => {
            handle_publish(ctx, connection, &publish).await?;
            match (publish.qos, publish.message_id) {
                (Qos::AtLeastOnce, Some(mid)) => write_puback(&mut frame, mid).await?,
                (Qos::ExactlyOnce, Some(mid)) => write_pubrec(&mut frame, mid).await?,
                _ => {}
            }
        }
        ControlPacket::PubRel(mid) => write_pubcomp(&mut frame, mid).await?,
        // Outbound delivery is QoS 0 only, so client acks have nothing to settle.
        ControlPacket::PubAck(_) | ControlPacket::PubRec(_) | ControlPacket::PubComp(_) => {}
        ControlPacket::Subscribe(sub) => handle_subscribe(ctx, connection, sub, &mut frame).await?,
        ControlPacket::Unsubscribe(unsub) => handle_unsubscribe(ctx, connection, unsub, &mut frame).await?,
        ControlPacket::PingReq => write_pingresp(&mut frame).await?,
        ControlPacket::Disconnect => return Ok(SessionAction::Disconnect),
    }
    if !frame.is_empty() {
        outbound
            .send(frame)
            .await
            .map_err(|_| anyhow!("connection writer closed"))?;
    }
    Ok(SessionAction::Continue)
}

async fn handle_publish(
    ctx: &BrokerCtx,
    connection: &ConnectionId,
    publish: &PublishPacket,
) -> Result<()> {
    validate_topic_name(&publish.topic)?;
    if ctx
        .bridge
        .authorize_publish(connection, &publish.topic)
        .await
        .is_err()
    {
        // Dropped without telling the client; the denial is already logged.
        return Ok(());
    }
    ctx.bridge.on_published(connection, &publish.topic);
    let delivered = ctx.router.publish(&publish.topic, &publish.payload);
    tracing::trace!(
        connection = %connection,
        topic = %publish.topic,
        delivered,
        "routed publish"
    );
    Ok(())
}

async fn handle_subscribe(
    ctx: &BrokerCtx,
    connection: &ConnectionId,
    sub: SubscribePacket,
    frame: &mut Vec<u8>,
) -> Result<()> {
    let checks = sub.filters.iter().map(|request| async move {
        if let Err(err) = validate_topic_filter(&request.topic_filter) {
            tracing::debug!(connection = %connection, "rejecting filter: {err}");
            return false;
        }
        ctx.bridge
            .authorize_subscribe(connection, &request.topic_filter)
            .await
            .is_ok()
    });
    let verdicts = join_all(checks).await;

    let mut grants = Vec::with_capacity(verdicts.len());
    let mut granted = Vec::new();
    for (request, allowed) in sub.filters.iter().zip(verdicts) {
        if allowed && ctx.router.subscribe(connection, &request.topic_filter) {
            grants.push(SubAckResult::Granted(Qos::AtMostOnce));
            granted.push(request.topic_filter.clone());
        } else {
            grants.push(SubAckResult::Failure);
        }
    }
    if !granted.is_empty() {
        ctx.bridge.on_subscribed(connection, granted);
    }
    write_suback(frame, sub.packet_id, &grants).await
}

async fn handle_unsubscribe(
    ctx: &BrokerCtx,
    connection: &ConnectionId,
    unsub: UnsubscribePacket,
    frame: &mut Vec<u8>,
) -> Result<()> {
    for topic in &unsub.topics {
        ctx.router.unsubscribe(connection, topic);
    }
    write_unsuback(frame, unsub.packet_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{AccessDecision, Identity, PermissionService, SessionStore};
    use crate::lifecycle::LifecycleLogger;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct Scripted;

    #[async_trait]
    impl PermissionService for Scripted {
        async fn check(&self, identity: &Identity, resource: &str) -> AccessDecision {
            match (identity.secret(), resource) {
                ("down", _) => AccessDecision::indeterminate("connection refused"),
                ("good", _) if !resource.starts_with("private") => AccessDecision::Allowed,
                _ => AccessDecision::Denied { status: 403 },
            }
        }
    }

    fn ctx() -> BrokerCtx {
        let bridge = AuthorizationBridge::new(
            Arc::new(SessionStore::new(16)),
            Arc::new(Scripted),
            LifecycleLogger::recording(),
        );
        BrokerCtx::new(bridge, Arc::new(Router::new()))
    }

    fn mqtt_str(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    fn connect_frame(level: u8, user: &str, pass: &str) -> Vec<u8> {
        let mut body = mqtt_str("MQTT");
        body.push(level);
        body.push(0xC2);
        body.extend_from_slice(&30u16.to_be_bytes());
        body.extend(mqtt_str("client"));
        body.extend(mqtt_str(user));
        body.extend(mqtt_str(pass));
        let mut frame = vec![0x10, body.len() as u8];
        frame.extend(body);
        frame
    }

    fn subscribe_frame(packet_id: u16, filters: &[&str]) -> Vec<u8> {
        let mut body = packet_id.to_be_bytes().to_vec();
        for filter in filters {
            body.extend(mqtt_str(filter));
            body.push(0x00);
        }
        let mut frame = vec![0x82, body.len() as u8];
        frame.extend(body);
        frame
    }

    async fn connect(ctx: &BrokerCtx, frame: Vec<u8>) -> (DuplexStream, [u8; 4]) {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(handle_connection(server, ctx.clone()));
        client.write_all(&frame).await.unwrap();
        let mut connack = [0u8; 4];
        client.read_exact(&mut connack).await.unwrap();
        (client, connack)
    }

    #[tokio::test]
    async fn connack_reflects_authentication_outcome() {
        let ctx = ctx();
        let (_ok, connack) = connect(&ctx, connect_frame(4, "alice", "good")).await;
        assert_eq!(connack, [0x20, 0x02, 0x00, 0x00]);
        let (_bad, connack) = connect(&ctx, connect_frame(4, "alice", "bad")).await;
        assert_eq!(connack[3], 0x04);
        let (_down, connack) = connect(&ctx, connect_frame(4, "alice", "down")).await;
        assert_eq!(connack[3], 0x03);
        let (_v5, connack) = connect(&ctx, connect_frame(5, "alice", "good")).await;
        assert_eq!(connack[3], 0x01);
        assert_eq!(ctx.bridge.sessions().len(), 1);
    }

    #[tokio::test]
    async fn denied_filters_fail_in_suback() {
        let ctx = ctx();
        let (mut client, _) = connect(&ctx, connect_frame(4, "alice", "good")).await;
        client
            .write_all(&subscribe_frame(9, &["sensors/+", "private/x", "bad/#/x"]))
            .await
            .unwrap();
        let mut suback = [0u8; 7];
        client.read_exact(&mut suback).await.unwrap();
        assert_eq!(suback, [0x90, 0x05, 0x00, 0x09, 0x00, 0x80, 0x80]);
    }

    #[tokio::test]
    async fn allowed_publish_reaches_subscriber_and_denied_is_acked() {
        let ctx = ctx();
        let (mut client, _) = connect(&ctx, connect_frame(4, "alice", "good")).await;
        client.write_all(&subscribe_frame(1, &["#"])).await.unwrap();
        let mut suback = [0u8; 5];
        client.read_exact(&mut suback).await.unwrap();

        // QoS 1 to a denied topic: PUBACK only, nothing routed
        let mut body = mqtt_str("private/x");
        body.extend_from_slice(&5u16.to_be_bytes());
        body.extend_from_slice(b"no");
        let mut frame = vec![0x32, body.len() as u8];
        frame.extend(body);
        client.write_all(&frame).await.unwrap();
        let mut puback = [0u8; 4];
        client.read_exact(&mut puback).await.unwrap();
        assert_eq!(puback, [0x40, 0x02, 0x00, 0x05]);

        let mut body = mqtt_str("sensors/temp");
        body.extend_from_slice(b"21");
        let mut frame = vec![0x30, body.len() as u8];
        frame.extend(body);
        client.write_all(&frame).await.unwrap();
        let expected = crate::broker::protocol::encode_publish("sensors/temp", b"21");
        let mut delivered = vec![0u8; expected.len()];
        client.read_exact(&mut delivered).await.unwrap();
        assert_eq!(delivered, expected);
    }

    #[tokio::test]
    async fn wildcard_publish_closes_the_connection() {
        let ctx = ctx();
        let (mut client, _) = connect(&ctx, connect_frame(4, "alice", "good")).await;
        let body = mqtt_str("sensors/#");
        let mut frame = vec![0x30, body.len() as u8];
        frame.extend(body);
        client.write_all(&frame).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.bridge.sessions().is_empty());
        assert!(ctx.router.is_empty());
    }

    /// Holds every check until released, then allows it.
    struct Held {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl PermissionService for Held {
        async fn check(&self, _identity: &Identity, _resource: &str) -> AccessDecision {
            self.started.notify_one();
            self.release.notified().await;
            AccessDecision::Allowed
        }
    }

    #[tokio::test]
    async fn client_gone_during_authentication_leaves_no_session() {
        let service = Arc::new(Held {
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let bridge = AuthorizationBridge::new(
            Arc::new(SessionStore::new(16)),
            service.clone(),
            LifecycleLogger::recording(),
        );
        let ctx = BrokerCtx::new(bridge, Arc::new(Router::new()));
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(server, ctx.clone()));

        client
            .write_all(&connect_frame(4, "alice", "good"))
            .await
            .unwrap();
        service.started.notified().await;
        drop(client);
        service.release.notify_one();

        assert!(task.await.unwrap().is_err());
        assert!(ctx.bridge.sessions().is_empty());
        assert!(ctx.router.is_empty());
        let kinds: Vec<_> = ctx
            .bridge
            .lifecycle()
            .events()
            .iter()
            .map(|event| event.kind())
            .collect();
        assert_eq!(kinds, vec!["connection_error"]);
    }
}
