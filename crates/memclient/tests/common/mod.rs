//! Shared helpers for integration tests: an in-process TCP server speaking
//! the memcached binary protocol, including quiet-command silence and the
//! multi-frame `stat` sequence.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use memclient::ServerAddress;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const REQUEST_MAGIC: u8 = 0x80;
const RESPONSE_MAGIC: u8 = 0x81;

const STATUS_OK: u16 = 0x0000;
const STATUS_KEY_NOT_FOUND: u16 = 0x0001;
const STATUS_KEY_EXISTS: u16 = 0x0002;
const STATUS_ITEM_NOT_STORED: u16 = 0x0005;
const STATUS_NON_NUMERIC: u16 = 0x0006;
const STATUS_UNKNOWN_COMMAND: u16 = 0x0081;

#[derive(Clone)]
struct Item {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

type Store = Arc<Mutex<HashMap<Vec<u8>, Item>>>;

/// In-process memcached-binary-protocol server for tests.
pub struct FakeMemcached {
    addr: SocketAddr,
    store: Store,
    stall: Arc<AtomicBool>,
    listener_task: JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FakeMemcached {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake server");
        Self::serve(listener).await
    }

    /// Bind a specific address; used to bring a "revived" server back up on
    /// the port the client already knows.
    pub async fn start_on(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.expect("rebind fake server");
        Self::serve(listener).await
    }

    async fn serve(listener: TcpListener) -> Self {
        let addr = listener.local_addr().expect("local addr");
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        let stall = Arc::new(AtomicBool::new(false));
        let conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_store = store.clone();
        let accept_stall = stall.clone();
        let accept_tasks = conn_tasks.clone();
        let listener_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { return };
                let store = accept_store.clone();
                let stall = accept_stall.clone();
                let handle = tokio::spawn(async move {
                    let _ = handle_session(socket, store, stall).await;
                });
                accept_tasks.lock().unwrap().push(handle);
            }
        });

        Self { addr, store, stall, listener_task, conn_tasks }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn server_address(&self) -> ServerAddress {
        ServerAddress::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn item_count(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.store.lock().unwrap().contains_key(key)
    }

    /// When stalled, requests are read but never answered.
    pub fn set_stalled(&self, stalled: bool) {
        self.stall.store(stalled, Ordering::Release);
    }

    /// Stop accepting and kill every open session.
    pub fn stop(&self) {
        self.listener_task.abort();
        for task in self.conn_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for FakeMemcached {
    fn drop(&mut self) {
        self.stop();
    }
}

fn frame(
    opcode: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + extras.len() + key.len() + value.len());
    out.push(RESPONSE_MAGIC);
    out.push(opcode);
    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    out.push(extras.len() as u8);
    out.push(0);
    out.extend_from_slice(&status.to_be_bytes());
    let total = (extras.len() + key.len() + value.len()) as u32;
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&opaque.to_be_bytes());
    out.extend_from_slice(&cas.to_be_bytes());
    out.extend_from_slice(extras);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

static CAS_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_cas() -> u64 {
    CAS_COUNTER.fetch_add(1, Ordering::Relaxed)
}

async fn handle_session(
    mut socket: TcpStream,
    store: Store,
    stall: Arc<AtomicBool>,
) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; 24];
        socket.read_exact(&mut header).await?;
        assert_eq!(header[0], REQUEST_MAGIC, "request magic");
        let opcode = header[1];
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        let total = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        let opaque = u32::from_be_bytes(header[12..16].try_into().unwrap());
        let cas = u64::from_be_bytes(header[16..24].try_into().unwrap());

        let mut body = vec![0u8; total];
        socket.read_exact(&mut body).await?;
        if stall.load(Ordering::Acquire) {
            continue;
        }
        let extras = &body[..extras_len];
        let key = &body[extras_len..extras_len + key_len];
        let value = &body[extras_len + key_len..];

        let quiet = matches!(
            opcode,
            0x09 | 0x0d | 0x11 | 0x12 | 0x13 | 0x14 | 0x15 | 0x16 | 0x17 | 0x18 | 0x19 | 0x1a | 0x1e
        );
        let mut close_after = false;
        let mut replies: Vec<Vec<u8>> = Vec::new();
        let reply = |status: u16, response_cas: u64, extras: &[u8], key: &[u8], value: &[u8]| {
            vec![frame(opcode, status, opaque, response_cas, extras, key, value)]
        };

        match opcode {
            // get / getq / gat / gatq
            0x00 | 0x09 | 0x1d | 0x1e => {
                let item = store.lock().unwrap().get(key).cloned();
                match item {
                    Some(item) => {
                        replies = reply(
                            STATUS_OK,
                            item.cas,
                            &item.flags.to_be_bytes(),
                            b"",
                            &item.value,
                        );
                    }
                    None if quiet => {}
                    None => replies = reply(STATUS_KEY_NOT_FOUND, 0, &[], b"", b"Not found"),
                }
            }
            // set / setq / add / addq / replace / replaceq
            0x01 | 0x11 | 0x02 | 0x12 | 0x03 | 0x13 => {
                let flags = u32::from_be_bytes(extras[0..4].try_into().unwrap());
                let mut map = store.lock().unwrap();
                let existing = map.get(key).cloned();
                let status = match opcode {
                    0x02 | 0x12 if existing.is_some() => STATUS_KEY_EXISTS,
                    0x03 | 0x13 if existing.is_none() => STATUS_KEY_NOT_FOUND,
                    _ if cas != 0 && existing.is_none() => STATUS_KEY_NOT_FOUND,
                    _ if cas != 0 && existing.as_ref().map(|item| item.cas) != Some(cas) => {
                        STATUS_KEY_EXISTS
                    }
                    _ => STATUS_OK,
                };
                if status == STATUS_OK {
                    let stored_cas = next_cas();
                    map.insert(
                        key.to_vec(),
                        Item { value: value.to_vec(), flags, cas: stored_cas },
                    );
                    if !quiet {
                        replies = reply(STATUS_OK, stored_cas, &[], b"", b"");
                    }
                } else {
                    replies = reply(status, 0, &[], b"", b"store failed");
                }
            }
            // delete / deleteq
            0x04 | 0x14 => {
                let removed = store.lock().unwrap().remove(key).is_some();
                if removed {
                    if !quiet {
                        replies = reply(STATUS_OK, 0, &[], b"", b"");
                    }
                } else {
                    replies = reply(STATUS_KEY_NOT_FOUND, 0, &[], b"", b"Not found");
                }
            }
            // incr / decr (+ quiet)
            0x05 | 0x15 | 0x06 | 0x16 => {
                let delta = u64::from_be_bytes(extras[0..8].try_into().unwrap());
                let initial = u64::from_be_bytes(extras[8..16].try_into().unwrap());
                let expiration = u32::from_be_bytes(extras[16..20].try_into().unwrap());
                let mut map = store.lock().unwrap();
                let outcome = match map.get(key) {
                    None if expiration == u32::MAX => Err(STATUS_KEY_NOT_FOUND),
                    None => Ok(initial),
                    Some(item) => match std::str::from_utf8(&item.value)
                        .ok()
                        .and_then(|text| text.parse::<u64>().ok())
                    {
                        Some(current) if matches!(opcode, 0x05 | 0x15) => {
                            Ok(current.wrapping_add(delta))
                        }
                        Some(current) => Ok(current.saturating_sub(delta)),
                        None => Err(STATUS_NON_NUMERIC),
                    },
                };
                match outcome {
                    Ok(updated) => {
                        let stored_cas = next_cas();
                        map.insert(
                            key.to_vec(),
                            Item {
                                value: updated.to_string().into_bytes(),
                                flags: 0,
                                cas: stored_cas,
                            },
                        );
                        if !quiet {
                            replies =
                                reply(STATUS_OK, stored_cas, &[], b"", &updated.to_be_bytes());
                        }
                    }
                    Err(status) => replies = reply(status, 0, &[], b"", b"counter failed"),
                }
            }
            // append / prepend (+ quiet)
            0x0e | 0x19 | 0x0f | 0x1a => {
                let mut map = store.lock().unwrap();
                match map.get_mut(key) {
                    Some(item) => {
                        if matches!(opcode, 0x0e | 0x19) {
                            item.value.extend_from_slice(value);
                        } else {
                            let mut combined = value.to_vec();
                            combined.extend_from_slice(&item.value);
                            item.value = combined;
                        }
                        item.cas = next_cas();
                        if !quiet {
                            replies = reply(STATUS_OK, item.cas, &[], b"", b"");
                        }
                    }
                    None => replies = reply(STATUS_ITEM_NOT_STORED, 0, &[], b"", b"Not stored"),
                }
            }
            // touch
            0x1c => {
                let found = store.lock().unwrap().contains_key(key);
                replies = if found {
                    reply(STATUS_OK, 0, &[], b"", b"")
                } else {
                    reply(STATUS_KEY_NOT_FOUND, 0, &[], b"", b"Not found")
                };
            }
            // quit / quitq
            0x07 | 0x17 => {
                if !quiet {
                    replies = reply(STATUS_OK, 0, &[], b"", b"");
                }
                close_after = true;
            }
            // flush / flushq
            0x08 | 0x18 => {
                store.lock().unwrap().clear();
                if !quiet {
                    replies = reply(STATUS_OK, 0, &[], b"", b"");
                }
            }
            // noop
            0x0a => replies = reply(STATUS_OK, 0, &[], b"", b""),
            // version
            0x0b => replies = reply(STATUS_OK, 0, &[], b"", b"1.6.99-fake"),
            // stat: one frame per statistic, empty-key terminator
            0x10 => {
                let items = store.lock().unwrap().len();
                replies.push(frame(opcode, STATUS_OK, opaque, 0, &[], b"pid", b"4242"));
                replies.push(frame(
                    opcode,
                    STATUS_OK,
                    opaque,
                    0,
                    &[],
                    b"curr_items",
                    items.to_string().as_bytes(),
                ));
                replies.push(frame(opcode, STATUS_OK, opaque, 0, &[], b"", b""));
            }
            // verbosity
            0x1b => replies = reply(STATUS_OK, 0, &[], b"", b""),
            other => {
                replies = vec![frame(other, STATUS_UNKNOWN_COMMAND, opaque, 0, &[], b"", b"")];
            }
        }

        for response in replies {
            socket.write_all(&response).await?;
        }
        socket.flush().await?;
        if close_after {
            return Ok(());
        }
    }
}

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `deadline` elapses.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
