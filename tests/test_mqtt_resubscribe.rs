//! Re-subscription after the broker drops the connection
//!
//! A minimal MQTT v5 broker on a local socket accepts the client, answers
//! its first SUBSCRIBE and then closes the socket. The supervisor has to
//! reconnect and subscribe again on its own before messages flow.

use std::time::Duration;
use suez_mqtt::config::MqttSection;
use suez_mqtt::transport::mqtt::{ConnectionState, MqttClient, ReconnectConfig};
use suez_mqtt::transport::{InboundMessage, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const CONNECT: u8 = 1;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

const WAIT: Duration = Duration::from_secs(5);

/// Decode a variable byte integer, returning the value and its length
fn read_varint(bytes: &[u8]) -> (usize, usize) {
    let mut value = 0usize;
    for (i, byte) in bytes.iter().enumerate().take(4) {
        value |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return (value, i + 1);
        }
    }
    (value, 4)
}

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;

    let mut remaining = 0usize;
    for shift in (0..28).step_by(7) {
        let byte = stream.read_u8().await?;
        remaining |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
    }

    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await?;
    Ok((header >> 4, body))
}

/// Packet id and first topic filter of a SUBSCRIBE body
fn parse_subscribe(body: &[u8]) -> (u16, String) {
    let packet_id = u16::from_be_bytes([body[0], body[1]]);
    let (properties_len, used) = read_varint(&body[2..]);
    let mut at = 2 + used + properties_len;
    let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
    at += 2;
    (
        packet_id,
        String::from_utf8_lossy(&body[at..at + len]).into_owned(),
    )
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.push(0); // no properties
    body.extend_from_slice(payload);

    let mut packet = vec![0x30, body.len() as u8];
    packet.extend(body);
    packet
}

/// Serve one client connection
///
/// The first session is closed right after its SUBACK; later sessions
/// answer the SUBACK with a refresh message on the subscribed topic.
async fn serve_session(
    mut stream: TcpStream,
    session: usize,
    subscriptions: mpsc::UnboundedSender<(usize, String)>,
) -> std::io::Result<()> {
    loop {
        let (kind, body) = read_packet(&mut stream).await?;
        match kind {
            CONNECT => stream.write_all(&[0x20, 0x03, 0x00, 0x00, 0x00]).await?,
            SUBSCRIBE => {
                let (packet_id, topic) = parse_subscribe(&body);
                let [hi, lo] = packet_id.to_be_bytes();
                stream.write_all(&[0x90, 0x04, hi, lo, 0x00, 0x01]).await?;
                let _ = subscriptions.send((session, topic.clone()));

                if session == 1 {
                    return Ok(());
                }
                stream.write_all(&publish_packet(&topic, b"daily")).await?;
            }
            PINGREQ => stream.write_all(&[0xD0, 0x00]).await?,
            DISCONNECT => return Ok(()),
            _ => {}
        }
    }
}

async fn spawn_broker() -> (u16, mpsc::UnboundedReceiver<(usize, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut session = 0;
        while let Ok((stream, _)) = listener.accept().await {
            session += 1;
            tokio::spawn(serve_session(stream, session, tx.clone()));
        }
    });

    (port, rx)
}

#[tokio::test]
async fn test_supervisor_resubscribes_after_connection_drop() {
    let (port, mut subscriptions) = spawn_broker().await;

    let section = MqttSection {
        host: "127.0.0.1".to_string(),
        port,
        ..MqttSection::default()
    };
    let reconnect = ReconnectConfig {
        backoff_pattern: vec![50],
        sustained_delay: 100,
        ..ReconnectConfig::default()
    };
    let mut client = MqttClient::new("suez-resubscribe", section)
        .with_reconnect_config(reconnect)
        .unwrap();

    client.connect().await.unwrap();
    let (tx, mut inbound) = mpsc::channel::<InboundMessage>(8);
    client.set_message_sender(tx);
    client.subscribe("water/refresh").await.unwrap();

    let first = timeout(WAIT, subscriptions.recv()).await.unwrap().unwrap();
    assert_eq!(first, (1, "water/refresh".to_string()));

    // Nobody calls subscribe again: the supervisor does it on the new session
    let second = timeout(WAIT, subscriptions.recv()).await.unwrap().unwrap();
    assert_eq!(second, (2, "water/refresh".to_string()));

    let message = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
    assert_eq!(message.topic, "water/refresh");
    assert_eq!(message.payload, b"daily");
    assert!(!message.retain);

    assert_eq!(client.connection_state(), Some(ConnectionState::Connected));

    client.disconnect().await.unwrap();
}
