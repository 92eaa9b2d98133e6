//! Shared test servers. Not every test binary uses every helper.
#![allow(dead_code)]

use repipe::frame::Frame;

use bytes::{Buf, Bytes, BytesMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::io::Cursor;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// A minimal in-process Redis double: enough of the command surface to
// exercise the client end-to-end, including MULTI/EXEC queueing and
// WRONGTYPE errors. State is per-connection, which keeps tests independent.
pub async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(handle_connection(socket));
        }
    });

    addr
}

/// A server that runs one connection through a hand-written script of reads
/// and writes. Used for timing, truncation, and pub/sub cases the double
/// cannot express.
pub async fn scripted_server<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        script(socket).await;
    });

    addr
}

/// A server that answers every request with a bulk echo of its first
/// argument, which makes a shifted reply stream observable.
pub async fn echo_server() -> SocketAddr {
    scripted_server(|mut socket| async move {
        let mut buffer = BytesMut::new();
        while let Some(request) = read_request(&mut socket, &mut buffer).await {
            let mut out = BytesMut::new();
            Frame::Bulk(request[1].clone()).encode(&mut out);
            if socket.write_all(&out).await.is_err() {
                return;
            }
        }
    })
    .await
}

/// Read from `socket` until `needle` has appeared `count` times.
pub async fn read_until(socket: &mut TcpStream, needle: &[u8], count: usize) {
    let mut seen = BytesMut::new();
    loop {
        let occurrences = seen
            .windows(needle.len())
            .filter(|window| *window == needle)
            .count();
        if occurrences >= count {
            return;
        }
        if socket.read_buf(&mut seen).await.unwrap_or(0) == 0 {
            panic!("peer closed before the expected request arrived");
        }
    }
}

enum Entry {
    Str(Bytes),
    Set(HashSet<Bytes>),
    Hash(Vec<(Bytes, Bytes)>),
    List(VecDeque<Bytes>),
    Sorted(Vec<(f64, Bytes)>),
}

type Store = HashMap<String, Entry>;

async fn handle_connection(mut socket: TcpStream) {
    let mut buffer = BytesMut::new();
    let mut store: Store = HashMap::new();
    let mut queued: Option<Vec<Vec<Bytes>>> = None;

    while let Some(request) = read_request(&mut socket, &mut buffer).await {
        let name = String::from_utf8(request[0].to_vec())
            .unwrap()
            .to_ascii_uppercase();

        let reply = if queued.is_some() && name != "EXEC" {
            queued.as_mut().unwrap().push(request);
            Frame::Simple("QUEUED".to_string())
        } else if name == "MULTI" {
            queued = Some(vec![]);
            Frame::Simple("OK".to_string())
        } else if name == "EXEC" {
            match queued.take() {
                Some(commands) => Frame::Array(
                    commands
                        .into_iter()
                        .map(|command| apply(&mut store, command))
                        .collect(),
                ),
                None => Frame::Error("ERR EXEC without MULTI".to_string()),
            }
        } else {
            apply(&mut store, request)
        };

        let mut out = BytesMut::new();
        reply.encode(&mut out);
        if socket.write_all(&out).await.is_err() {
            return;
        }
    }
}

async fn read_request(socket: &mut TcpStream, buffer: &mut BytesMut) -> Option<Vec<Bytes>> {
    loop {
        let mut cursor = Cursor::new(&buffer[..]);
        if Frame::check(&mut cursor).is_ok() {
            let len = cursor.position() as usize;
            cursor.set_position(0);
            let frame = Frame::parse(&mut cursor).unwrap();
            buffer.advance(len);

            let items = match frame {
                Frame::Array(items) => items,
                other => panic!("request was not an array: {:?}", other),
            };
            return Some(
                items
                    .into_iter()
                    .map(|item| match item {
                        Frame::Bulk(data) => data,
                        other => panic!("request argument was not bulk: {:?}", other),
                    })
                    .collect(),
            );
        }

        if socket.read_buf(buffer).await.unwrap_or(0) == 0 {
            return None;
        }
    }
}

fn apply(store: &mut Store, request: Vec<Bytes>) -> Frame {
    let name = String::from_utf8(request[0].to_vec())
        .unwrap()
        .to_ascii_uppercase();
    let key = |index: usize| String::from_utf8(request[index].to_vec()).unwrap();

    match name.as_str() {
        "PING" => match request.get(1) {
            Some(msg) => Frame::Bulk(msg.clone()),
            None => Frame::Simple("PONG".to_string()),
        },
        "SET" => {
            store.insert(key(1), Entry::Str(request[2].clone()));
            Frame::Simple("OK".to_string())
        }
        "GET" => match store.get(&key(1)) {
            Some(Entry::Str(value)) => Frame::Bulk(value.clone()),
            Some(_) => wrong_type(),
            None => Frame::Null,
        },
        "DEL" => Frame::Integer(store.remove(&key(1)).is_some() as i64),
        "EXISTS" => Frame::Integer(store.contains_key(&key(1)) as i64),
        "EXPIRE" => Frame::Integer(store.contains_key(&key(1)) as i64),
        "INCR" => {
            let current = match store.get(&key(1)) {
                Some(Entry::Str(value)) => {
                    match std::str::from_utf8(value).ok().and_then(|s| s.parse::<i64>().ok()) {
                        Some(n) => n,
                        None => {
                            return Frame::Error(
                                "ERR value is not an integer or out of range".to_string(),
                            )
                        }
                    }
                }
                Some(_) => return wrong_type(),
                None => 0,
            };
            let next = current + 1;
            store.insert(key(1), Entry::Str(Bytes::from(next.to_string())));
            Frame::Integer(next)
        }
        "SADD" => {
            let entry = store.entry(key(1)).or_insert_with(|| Entry::Set(HashSet::new()));
            match entry {
                Entry::Set(members) => Frame::Integer(members.insert(request[2].clone()) as i64),
                _ => wrong_type(),
            }
        }
        "SMEMBERS" => match store.get(&key(1)) {
            Some(Entry::Set(members)) => Frame::Array(
                members.iter().map(|member| Frame::Bulk(member.clone())).collect(),
            ),
            Some(_) => wrong_type(),
            None => Frame::Array(vec![]),
        },
        "HSET" => {
            let entry = store.entry(key(1)).or_insert_with(|| Entry::Hash(vec![]));
            match entry {
                Entry::Hash(fields) => {
                    let field = request[2].clone();
                    let value = request[3].clone();
                    match fields.iter_mut().find(|(f, _)| *f == field) {
                        Some(pair) => {
                            pair.1 = value;
                            Frame::Integer(0)
                        }
                        None => {
                            fields.push((field, value));
                            Frame::Integer(1)
                        }
                    }
                }
                _ => wrong_type(),
            }
        }
        "HGETALL" => match store.get(&key(1)) {
            Some(Entry::Hash(fields)) => Frame::Array(
                fields
                    .iter()
                    .flat_map(|(field, value)| {
                        [Frame::Bulk(field.clone()), Frame::Bulk(value.clone())]
                    })
                    .collect(),
            ),
            Some(_) => wrong_type(),
            None => Frame::Array(vec![]),
        },
        "RPUSH" | "LPUSH" => {
            let entry = store.entry(key(1)).or_insert_with(|| Entry::List(VecDeque::new()));
            match entry {
                Entry::List(items) => {
                    if name == "RPUSH" {
                        items.push_back(request[2].clone());
                    } else {
                        items.push_front(request[2].clone());
                    }
                    Frame::Integer(items.len() as i64)
                }
                _ => wrong_type(),
            }
        }
        "RPOP" => match store.get_mut(&key(1)) {
            Some(Entry::List(items)) => match items.pop_back() {
                Some(value) => Frame::Bulk(value),
                None => Frame::Null,
            },
            Some(_) => wrong_type(),
            None => Frame::Null,
        },
        "LRANGE" => match store.get(&key(1)) {
            Some(Entry::List(items)) => {
                Frame::Array(items.iter().map(|item| Frame::Bulk(item.clone())).collect())
            }
            Some(_) => wrong_type(),
            None => Frame::Array(vec![]),
        },
        "ZADD" => {
            let entry = store.entry(key(1)).or_insert_with(|| Entry::Sorted(vec![]));
            match entry {
                Entry::Sorted(members) => {
                    let score = std::str::from_utf8(&request[2])
                        .unwrap()
                        .parse::<f64>()
                        .unwrap();
                    members.push((score, request[3].clone()));
                    members.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
                    Frame::Integer(1)
                }
                _ => wrong_type(),
            }
        }
        "ZRANGE" => match store.get(&key(1)) {
            Some(Entry::Sorted(members)) => {
                let with_scores = request
                    .last()
                    .map(|arg| arg.eq_ignore_ascii_case(b"WITHSCORES"))
                    .unwrap_or(false);
                let mut items = vec![];
                for (score, member) in members {
                    items.push(Frame::Bulk(member.clone()));
                    if with_scores {
                        items.push(Frame::Bulk(Bytes::from(score.to_string())));
                    }
                }
                Frame::Array(items)
            }
            Some(_) => wrong_type(),
            None => Frame::Array(vec![]),
        },
        "PUBLISH" => Frame::Integer(0),
        _ => Frame::Error(format!("ERR unknown command '{}'", name)),
    }
}

fn wrong_type() -> Frame {
    Frame::Error(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}
