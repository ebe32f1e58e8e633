//! In-memory server used by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lodestar::bson::codec::decode_document;
use lodestar::pool::{BoxedStream, Connector};
use lodestar::wire::message::{encode_op_msg, parse_op_msg};
use lodestar::wire::{DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN, Header, OpCode, read_frame};
use lodestar::{Document, DriverResult, ServerAddress};
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

/// How the server answers one request.
pub enum Behavior {
    /// Answer with this document.
    Reply(Document),
    /// Answer with a response-to that does not match the request.
    WrongResponseTo(Document),
    /// Legacy reply with the query failure flag set.
    QueryFailure(Document),
    /// Never answer.
    Hang,
}

/// A request as the server saw it.
#[derive(Debug, Clone)]
pub struct Seen {
    pub address: ServerAddress,
    pub op_code: i32,
    pub flags: i32,
    pub namespace: Option<String>,
    pub command: Document,
}

type Handler = dyn Fn(&ServerAddress, &Document) -> Behavior + Send + Sync;

/// Connector that answers every connection from an in-process task.
#[derive(Clone)]
pub struct MockServer {
    handler: Arc<Handler>,
    connects: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer")
            .field("connects", &self.connects())
            .finish()
    }
}

impl MockServer {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ServerAddress, &Document) -> Behavior + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            connects: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answers `{ ok: 1 }` to everything.
    pub fn ok() -> Self {
        Self::new(|_, _| Behavior::Reply(lodestar::doc! { "ok" => 1.0 }))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    async fn serve(self, mut stream: DuplexStream, address: ServerAddress) {
        loop {
            let Ok((header, body)) = read_frame(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).await else {
                return;
            };
            let (flags, namespace, command) = match OpCode::from_i32(header.op_code) {
                Some(OpCode::Message) => {
                    let msg = parse_op_msg(&body).unwrap();
                    (msg.flags as i32, None, decode_document(msg.body).unwrap())
                }
                Some(OpCode::Query) => parse_query(&body),
                other => panic!("unexpected request opcode {:?}", other),
            };
            self.seen.lock().unwrap().push(Seen {
                address: address.clone(),
                op_code: header.op_code,
                flags,
                namespace,
                command: command.clone(),
            });

            let legacy = header.op_code == OpCode::Query as i32;
            let frame = match (self.handler)(&address, &command) {
                Behavior::Reply(reply) => reply_frame(legacy, header.request_id, 0, &reply),
                Behavior::WrongResponseTo(reply) => {
                    reply_frame(legacy, header.request_id + 1000, 0, &reply)
                }
                Behavior::QueryFailure(reply) => reply_frame(true, header.request_id, 2, &reply),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return;
                }
            };
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl Connector for MockServer {
    async fn connect(&self, address: &ServerAddress, _timeout: Duration) -> DriverResult<BoxedStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(self.clone().serve(server, address.clone()));
        Ok(Box::new(client))
    }
}

fn parse_query(body: &[u8]) -> (i32, Option<String>, Document) {
    let flags = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let nul = body[4..].iter().position(|b| *b == 0).unwrap() + 4;
    let namespace = String::from_utf8(body[4..nul].to_vec()).unwrap();
    let start = nul + 1 + 8;
    (flags, Some(namespace), decode_document(&body[start..]).unwrap())
}

fn reply_frame(legacy: bool, response_to: i32, reply_flags: i32, reply: &Document) -> Vec<u8> {
    let doc = reply.to_vec().unwrap();
    if legacy {
        let mut body = Vec::new();
        body.extend_from_slice(&reply_flags.to_le_bytes());
        body.extend_from_slice(&0i64.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&doc);
        let header = Header {
            length: (HEADER_LEN + body.len()) as i32,
            request_id: 1,
            response_to,
            op_code: OpCode::Reply as i32,
        };
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(&body);
        frame
    } else {
        let mut frame = encode_op_msg(1, 0, &doc).unwrap();
        frame[8..12].copy_from_slice(&response_to.to_le_bytes());
        frame
    }
}
