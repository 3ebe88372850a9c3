//! Embedded MQTT broker that turns sensor publishes into stored readings.
//!
//! The broker only accepts publishes: it acknowledges them at whatever QoS
//! the client asked for, hands payloads on [`SENSOR_TOPIC`] to the
//! [`Gateway`], and refuses subscriptions. Framing is done by `rumqttc`'s
//! MQTT 3.1.1 codec.

use bytes::BytesMut;
use rumqttc::mqttbytes::{
    self,
    v4::{
        self, ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec, SubAck,
        SubscribeReasonCode, UnsubAck,
    },
    Protocol, QoS,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::ingest::Gateway;

/// Topic the sensor publishes its temperature on.
pub const SENSOR_TOPIC: &str = "casa/esp32/datos";

const MAX_PACKET_SIZE: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] mqttbytes::Error),
    #[error("first packet was not CONNECT")]
    NotConnected,
    #[error("second CONNECT on one connection")]
    DuplicateConnect,
    #[error("unsupported protocol version")]
    UnsupportedProtocol,
    #[error("no packet within {0:?}")]
    Timeout(Duration),
    #[error("connection closed mid-packet")]
    UnexpectedEof,
}

pub struct Broker {
    listener: TcpListener,
    gateway: Gateway,
}

impl Broker {
    pub async fn bind(addr: SocketAddr, gateway: Gateway) -> io::Result<Broker> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Broker { listener, gateway })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients forever, one task per connection.
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("[MQTT] Failed to accept connection: {e}");
                    time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let session = Session::new(stream, peer, self.gateway.clone());
            tokio::spawn(session.run());
        }
    }
}

struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Gateway,
    read: BytesMut,
    client_id: Option<String>,
    /// How long the client may stay silent before it is dropped.
    idle_limit: Option<Duration>,
}

impl Session {
    fn new(stream: TcpStream, peer: SocketAddr, gateway: Gateway) -> Self {
        Self {
            stream,
            peer,
            gateway,
            read: BytesMut::with_capacity(1024),
            client_id: None,
            idle_limit: Some(CONNECT_TIMEOUT),
        }
    }

    async fn run(mut self) {
        let result = self.serve().await;

        let client = self.client_id.as_deref().unwrap_or("unknown");
        match result {
            Ok(()) => log::info!("[MQTT] Client disconnected: {client}"),
            Err(e) => log::warn!("[MQTT] Client {client} ({}) dropped: {e}", self.peer),
        }
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        while let Some(packet) = self.next_packet().await? {
            if self.client_id.is_none() && !matches!(packet, Packet::Connect(_)) {
                return Err(SessionError::NotConnected);
            }

            match packet {
                Packet::Connect(connect) => {
                    if self.client_id.is_some() {
                        return Err(SessionError::DuplicateConnect);
                    }
                    if connect.protocol != Protocol::V4 {
                        return self.refuse_protocol().await;
                    }

                    let client_id = if connect.client_id.is_empty() {
                        format!("anonymous-{}", self.peer)
                    } else {
                        connect.client_id
                    };
                    log::info!("[MQTT] Client connected: {client_id}");

                    // A client may go 1.5 keep-alive periods without sending anything.
                    self.idle_limit = (connect.keep_alive > 0)
                        .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));
                    self.client_id = Some(client_id);

                    let mut buf = BytesMut::new();
                    ConnAck::new(ConnectReturnCode::Success, false).write(&mut buf)?;
                    self.send(buf).await?;
                }
                Packet::Publish(publish) => {
                    if publish.topic == SENSOR_TOPIC {
                        log::info!(
                            "[MQTT] Data received: {}",
                            String::from_utf8_lossy(&publish.payload)
                        );
                        self.gateway.accept_mqtt(&publish.payload).await;
                    } else {
                        log::debug!("[MQTT] Ignoring publish on {}", publish.topic);
                    }

                    let mut buf = BytesMut::new();
                    match publish.qos {
                        QoS::AtMostOnce => continue,
                        QoS::AtLeastOnce => PubAck::new(publish.pkid).write(&mut buf)?,
                        QoS::ExactlyOnce => PubRec::new(publish.pkid).write(&mut buf)?,
                    };
                    self.send(buf).await?;
                }
                Packet::PubRel(pubrel) => {
                    let mut buf = BytesMut::new();
                    PubComp::new(pubrel.pkid).write(&mut buf)?;
                    self.send(buf).await?;
                }
                Packet::Subscribe(subscribe) => {
                    log::debug!(
                        "[MQTT] Refusing {} subscription(s)",
                        subscribe.filters.len()
                    );
                    let refusals = vec![SubscribeReasonCode::Failure; subscribe.filters.len()];

                    let mut buf = BytesMut::new();
                    SubAck::new(subscribe.pkid, refusals).write(&mut buf)?;
                    self.send(buf).await?;
                }
                Packet::Unsubscribe(unsubscribe) => {
                    let mut buf = BytesMut::new();
                    UnsubAck::new(unsubscribe.pkid).write(&mut buf)?;
                    self.send(buf).await?;
                }
                Packet::PingReq => {
                    let mut buf = BytesMut::new();
                    PingResp.write(&mut buf)?;
                    self.send(buf).await?;
                }
                Packet::Disconnect => return Ok(()),
                other => log::debug!("[MQTT] Ignoring {other:?}"),
            }
        }

        Ok(())
    }

    /// Answers a CONNECT for a protocol other than 3.1.1 and ends the session.
    async fn refuse_protocol(&mut self) -> Result<(), SessionError> {
        let mut buf = BytesMut::new();
        ConnAck::new(ConnectReturnCode::RefusedProtocolVersion, false).write(&mut buf)?;
        self.send(buf).await?;

        Err(SessionError::UnsupportedProtocol)
    }

    /// Next complete packet, or `None` once the client closes the connection cleanly.
    async fn next_packet(&mut self) -> Result<Option<Packet>, SessionError> {
        loop {
            match v4::read(&mut self.read, MAX_PACKET_SIZE) {
                Ok(packet) => return Ok(Some(packet)),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(mqttbytes::Error::InvalidProtocol | mqttbytes::Error::InvalidProtocolLevel(_))
                    if self.client_id.is_none() =>
                {
                    return self.refuse_protocol().await.map(|()| None);
                }
                Err(e) => return Err(e.into()),
            }

            let read = match self.idle_limit {
                Some(limit) => time::timeout(limit, self.stream.read_buf(&mut self.read))
                    .await
                    .map_err(|_| SessionError::Timeout(limit))??,
                None => self.stream.read_buf(&mut self.read).await?,
            };

            if read == 0 {
                return if self.read.is_empty() {
                    Ok(None)
                } else {
                    Err(SessionError::UnexpectedEof)
                };
            }
        }
    }

    async fn send(&mut self, buf: BytesMut) -> Result<(), SessionError> {
        self.stream.write_all(&buf).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rumqttc::{AsyncClient, Event, MqttOptions};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::db::{Filter, Store};

    const CONNECT_V4: [u8; 16] = [
        0x10, 14, 0, 4, b'M', b'Q', b'T', b'T', 4, 0x02, 0, 60, 0, 2, b'c', b'1',
    ];

    async fn start() -> (SocketAddr, Store, Gateway) {
        let store = Store::in_memory();
        store.initialize().await.unwrap();
        let gateway = Gateway::new(store.clone());

        let broker = Broker::bind("127.0.0.1:0".parse().unwrap(), gateway.clone())
            .await
            .unwrap();
        let addr = broker.local_addr().unwrap();
        tokio::spawn(broker.run());

        (addr, store, gateway)
    }

    /// Publishes at QoS 1 and waits for the PUBACK, which the broker sends only
    /// after the payload has been handled.
    async fn publish(addr: SocketAddr, payload: &str) {
        let mut options = MqttOptions::new("sensor-test", addr.ip().to_string(), addr.port());
        options.set_keep_alive(Duration::from_secs(5));
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        client
            .publish(SENSOR_TOPIC, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .unwrap();

        time::timeout(Duration::from_secs(5), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => break,
                    Ok(_) => {}
                    Err(e) => panic!("MQTT connection failed: {e}"),
                }
            }
        })
        .await
        .expect("broker never acknowledged the publish");
    }

    async fn read_exact<const N: usize>(stream: &mut TcpStream) -> [u8; N] {
        let mut buf = [0; N];
        time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn numeric_publish_is_stored() {
        let (addr, store, _gateway) = start().await;

        publish(addr, "25.5").await;

        let rows = store.query(Filter::Latest(50)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].temperature, 25.5);
        assert_eq!(rows[0].humidity, 0.0);
    }

    #[tokio::test]
    async fn non_numeric_publish_is_dropped_silently() {
        let (addr, store, gateway) = start().await;

        publish(addr, "not-a-number").await;

        assert_eq!(store.count().await, 0);
        assert_eq!(gateway.discarded(), 1);
    }

    #[tokio::test]
    async fn exactly_once_handshake_and_refused_subscription() {
        let (addr, store, _gateway) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(&CONNECT_V4).await.unwrap();
        assert_eq!(read_exact::<4>(&mut stream).await, [0x20, 2, 0, 0]);

        let mut publish = vec![0x34, 0];
        publish.extend_from_slice(&[0, 16]);
        publish.extend_from_slice(SENSOR_TOPIC.as_bytes());
        publish.extend_from_slice(&[0, 42]);
        publish.extend_from_slice(b"19.5");
        publish[1] = (publish.len() - 2) as u8;
        stream.write_all(&publish).await.unwrap();
        assert_eq!(read_exact::<4>(&mut stream).await, [0x50, 2, 0, 42]);

        stream.write_all(&[0x62, 2, 0, 42]).await.unwrap();
        assert_eq!(read_exact::<4>(&mut stream).await, [0x70, 2, 0, 42]);

        stream
            .write_all(&[0x82, 6, 0, 7, 0, 1, b'#', 0])
            .await
            .unwrap();
        assert_eq!(read_exact::<5>(&mut stream).await, [0x90, 3, 0, 7, 0x80]);

        stream.write_all(&[0xc0, 0]).await.unwrap();
        assert_eq!(read_exact::<2>(&mut stream).await, [0xd0, 0]);

        stream.write_all(&[0xe0, 0]).await.unwrap();
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn other_topics_are_not_stored() {
        let (addr, store, _gateway) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&CONNECT_V4).await.unwrap();
        read_exact::<4>(&mut stream).await;

        let mut publish = vec![0x32, 0, 0, 5];
        publish.extend_from_slice(b"other");
        publish.extend_from_slice(&[0, 1]);
        publish.extend_from_slice(b"21.0");
        publish[1] = (publish.len() - 2) as u8;
        stream.write_all(&publish).await.unwrap();

        assert_eq!(read_exact::<4>(&mut stream).await, [0x40, 2, 0, 1]);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn publish_before_connect_closes_the_connection() {
        let (addr, store, _gateway) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(&[0x30, 7, 0, 1, b't', b'2', b'0', b'.', b'0']).await.unwrap();

        let mut buf = [0; 1];
        let read = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(read, 0);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn unsupported_protocol_level_is_refused() {
        let (addr, _store, _gateway) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut connect = CONNECT_V4;
        connect[8] = 5;

        stream.write_all(&connect).await.unwrap();

        assert_eq!(read_exact::<4>(&mut stream).await, [0x20, 2, 0, 1]);
    }

    #[tokio::test]
    async fn mqtt_3_1_connect_is_refused() {
        let (addr, _store, _gateway) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut connect = vec![0x10, 16, 0, 6];
        connect.extend_from_slice(b"MQIsdp");
        connect.extend_from_slice(&[3, 0x02, 0, 60, 0, 2, b'c', b'1']);
        stream.write_all(&connect).await.unwrap();

        assert_eq!(read_exact::<4>(&mut stream).await, [0x20, 2, 0, 1]);
    }

    #[tokio::test]
    async fn packets_split_across_reads_are_reassembled() {
        let (addr, store, _gateway) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let (head, tail) = CONNECT_V4.split_at(5);
        stream.write_all(head).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        stream.write_all(tail).await.unwrap();
        assert_eq!(read_exact::<4>(&mut stream).await, [0x20, 2, 0, 0]);

        let mut publish = vec![0x32, 0, 0, 16];
        publish.extend_from_slice(SENSOR_TOPIC.as_bytes());
        publish.extend_from_slice(&[0, 9]);
        publish.extend_from_slice(b"22.25");
        publish[1] = (publish.len() - 2) as u8;
        for chunk in publish.chunks(3) {
            stream.write_all(chunk).await.unwrap();
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(read_exact::<4>(&mut stream).await, [0x40, 2, 0, 9]);

        stream.write_all(&[0xa2, 5, 0, 3, 0, 1, b'#']).await.unwrap();
        assert_eq!(read_exact::<4>(&mut stream).await, [0xb0, 2, 0, 3]);

        let rows = store.query(Filter::Latest(50)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].temperature, 22.25);
    }
}
