//! In-memory server for end-to-end tests.
//!
//! The client side of a `tokio::io::duplex` pipe becomes the bridge
//! [`Channel`]; the test drives the other side through [`FakeServer`].

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use omnilink::bridge::codec::{Frame, FrameCodec};
use omnilink::bridge::protocol::{Request, decode_request};
use omnilink::{BridgeConfig, Channel, Client};
use serde_json::{Value, json};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

const PIPE_CAPACITY: usize = 256 * 1024;
const MAX_FRAME: usize = 16 * 1024 * 1024;

pub struct FakeServer {
    requests: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
    output: WriteHalf<DuplexStream>,
}

pub fn pipe() -> (Channel, FakeServer) {
    let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    (
        Channel::new(client_read, client_write),
        FakeServer {
            requests: FramedRead::new(server_read, FrameCodec::new(MAX_FRAME)),
            output: server_write,
        },
    )
}

pub fn connect(config: BridgeConfig) -> (Client, FakeServer) {
    let (channel, server) = pipe();
    let client = Client::connect(channel, config).expect("valid config");
    (client, server)
}

impl FakeServer {
    pub async fn next_request(&mut self) -> Request {
        match self.requests.next().await {
            Some(Ok(Frame::Payload(body))) => decode_request(&body).expect("request JSON"),
            other => panic!("expected a request frame, got {other:?}"),
        }
    }

    /// Read and drop requests until the client closes its side.
    pub async fn discard_requests(mut self) -> usize {
        let mut count = 0;
        while let Some(Ok(_)) = self.requests.next().await {
            count += 1;
        }
        count
    }

    /// Write raw bytes, for hand-built frames.
    pub async fn write_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.output.write_all(bytes).await.unwrap();
        self.output.flush().await.unwrap();
    }

    pub async fn send(&mut self, value: Value) {
        let body = Bytes::from(serde_json::to_vec(&value).unwrap());
        let mut sink = FramedWrite::new(&mut self.output, FrameCodec::new(MAX_FRAME));
        sink.send(body).await.unwrap();
    }

    pub async fn reply(&mut self, request: &Request, body: Value) {
        self.send(json!({
            "command": request.command,
            "request_seq": request.correlation_id,
            "seq": request.correlation_id + 1000,
            "type": "response",
            "success": true,
            "message": null,
            "body": body,
        }))
        .await;
    }

    pub async fn fail(&mut self, request: &Request, message: &str) {
        self.send(json!({
            "command": request.command,
            "request_seq": request.correlation_id,
            "seq": request.correlation_id + 1000,
            "type": "response",
            "success": false,
            "message": message,
        }))
        .await;
    }

    pub async fn event(&mut self, name: &str, body: Value) {
        self.send(json!({"event": name, "seq": 1, "type": "event", "body": body}))
            .await;
    }
}
