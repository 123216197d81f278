//! Runtime RPC: framed request/response messages layered on the runtime-IPC
//! topic as two-segment packets (header + opaque payload).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::mpsc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::schema::{self, ConnectToRemoteServer, EnsureServiceStarted, RipcHeader, RpcInvoke};
use crate::segmented::emit_segments;
use crate::session::Outbound;
use crate::topics::TOPIC_RUNTIME_IPC;

pub const RIPC_ENSURE_SERVICE_STARTED: u32 = 1;
pub const RIPC_CONNECT_TO_REMOTE_SERVER: u32 = 2;
pub const RIPC_RPC: u32 = 3;

/// Services brought up once pairing completes: `(package, service, server)`.
pub const CORE_SERVICES: &[(&str, &str, &str)] = &[
    (
        "com.oculus.systemdriver",
        "com.oculus.vrruntimeservice.VrRuntimeService",
        "RuntimeServiceServer",
    ),
    (
        "com.oculus.bodyapiservice",
        "com.oculus.bodyapiservice.BodyApiService",
        "BodyApiServiceServer",
    ),
    (
        "com.oculus.eyetrackingservice",
        "com.oculus.eyetrackingservice.EyeTrackingService",
        "EyeTrackingServiceServer",
    ),
];

/// 64-bit method identifier: FNV-1a of the method name, return type and
/// argument signature, folded together.
pub fn method_id(method: &str, ret: &str, args: &str) -> u64 {
    fnv1a64(method) ^ fnv1a64(ret) ^ fnv1a64(args)
}

fn fnv1a64(s: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Handle on an in-flight call; the reply payload arrives via the reader
/// thread.
pub struct PendingReply {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl PendingReply {
    pub fn wait(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.rx
            .recv_timeout(timeout)
            .map_err(|_| Error::Protocol("RPC reply timed out or session reset".into()))
    }
}

struct Inner {
    next_client_id: u32,
    next_msg_idx: u32,
    pending: HashMap<(u32, u32), mpsc::Sender<Vec<u8>>>,
}

pub struct RipcClient {
    inner: Mutex<Inner>,
}

impl RipcClient {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_client_id: 1,
                next_msg_idx: 0,
                pending: HashMap::new(),
            }),
        }
    }

    /// Allocate a client identifier for one logical service connection.
    pub fn new_client(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_client_id;
        inner.next_client_id += 1;
        id
    }

    pub fn ensure_service_started(
        &self,
        out: &Outbound,
        client_id: u32,
        package: &str,
        service: &str,
    ) -> Result<PendingReply> {
        let payload = schema::encode(&EnsureServiceStarted {
            package: package.into(),
            service: service.into(),
        })?;
        self.send_cmd(out, client_id, RIPC_ENSURE_SERVICE_STARTED, &payload)
    }

    pub fn connect_to_remote_server(
        &self,
        out: &Outbound,
        client_id: u32,
        server_name: &str,
    ) -> Result<PendingReply> {
        let payload = schema::encode(&ConnectToRemoteServer {
            server_name: server_name.into(),
        })?;
        self.send_cmd(out, client_id, RIPC_CONNECT_TO_REMOTE_SERVER, &payload)
    }

    pub fn invoke(
        &self,
        out: &Outbound,
        client_id: u32,
        method_id: u64,
        args: &[u8],
    ) -> Result<PendingReply> {
        let payload = schema::encode(&RpcInvoke {
            method_id,
            args: args.to_vec(),
        })?;
        self.send_cmd(out, client_id, RIPC_RPC, &payload)
    }

    fn send_cmd(
        &self,
        out: &Outbound,
        client_id: u32,
        cmd_id: u32,
        payload: &[u8],
    ) -> Result<PendingReply> {
        let header = schema::encode(&RipcHeader {
            cmd_id,
            next_size: payload.len() as u32,
            client_id,
            unk: 0,
        })?;
        let (tx, rx) = mpsc::channel();
        let msg_idx;
        {
            let mut inner = self.inner.lock().unwrap();
            msg_idx = inner.next_msg_idx;
            inner.next_msg_idx = inner.next_msg_idx.wrapping_add(1);
            inner.pending.insert((client_id, cmd_id), tx);
        }
        let frames = emit_segments(msg_idx, &[&header, payload]);
        out.send_frames(TOPIC_RUNTIME_IPC, &frames)?;
        Ok(PendingReply { rx })
    }

    /// Complete a pending call from a reassembled reply.
    pub(crate) fn on_reply(&self, segments: &mut [Vec<u8>]) {
        if segments.len() != 2 {
            warn!("RPC reply with {} segments dropped", segments.len());
            return;
        }
        let header: RipcHeader = match schema::decode(&segments[0]) {
            Ok(header) => header,
            Err(err) => {
                warn!("undecodable RPC reply header: {err}");
                return;
            }
        };
        let mut payload = std::mem::take(&mut segments[1]);
        payload.truncate(header.next_size as usize);
        let sender = self
            .inner
            .lock()
            .unwrap()
            .pending
            .remove(&(header.client_id, header.cmd_id));
        match sender {
            Some(tx) => {
                let _ = tx.send(payload);
            }
            None => debug!(
                "unmatched RPC reply client={} cmd={}",
                header.client_id, header.cmd_id
            ),
        }
    }

    /// Drop all pending calls; their waiters see an error.
    pub fn reset(&self) {
        self.inner.lock().unwrap().pending.clear();
    }

    /// Start and connect the always-on services after pairing.
    pub(crate) fn bring_up(&self, out: &Outbound) {
        for (package, service, server) in CORE_SERVICES {
            let client_id = self.new_client();
            if let Err(err) = self.ensure_service_started(out, client_id, package, service) {
                warn!("ensure {service} failed: {err}");
                continue;
            }
            if let Err(err) = self.connect_to_remote_server(out, client_id, server) {
                warn!("connect {server} failed: {err}");
            }
        }
    }
}

impl Default for RipcClient {
    fn default() -> Self {
        Self::new()
    }
}
