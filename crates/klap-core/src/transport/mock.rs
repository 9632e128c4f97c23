//! In-process simulated KLAP device for tests.
//!
//! Implements the device side of both handshake steps and the encrypted
//! request channel, keeps a small bulb state, and counts every call so tests
//! can assert how many handshakes and requests happened.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use serde_json::{Value, json};

use crate::{
    Credentials,
    crypto::klap::{
        AuthHash, CipherKeys, generate_auth_hash, handshake1_seed_auth_hash,
        handshake2_seed_auth_hash,
    },
    error::Error,
    transport::{
        HANDSHAKE1_PATH, HANDSHAKE2_PATH, HttpResponse, Transport, TransportFactory,
    },
};

#[derive(Default)]
struct DeviceState {
    pending: Option<([u8; 16], [u8; 16], String)>,
    active: Option<(CipherKeys, String)>,
    cookie_counter: u32,
    expire_next: usize,
    info: Value,
    methods: Vec<String>,
    envelopes: Vec<Value>,
}

/// Simulated device answering the KLAP protocol.
pub(crate) struct MockDevice {
    auth_hash: AuthHash,
    state: Mutex<DeviceState>,
    pub handshake1_calls: AtomicUsize,
    pub handshake2_calls: AtomicUsize,
    pub request_calls: AtomicUsize,
}

impl MockDevice {
    /// A bulb that authenticates `credentials` and starts switched off.
    pub fn new(credentials: &Credentials) -> Arc<Self> {
        Arc::new(Self {
            auth_hash: generate_auth_hash(credentials),
            state: Mutex::new(DeviceState {
                info: json!({
                    "device_id": "80223A8E5B1C",
                    "nickname": "TGl2aW5nIFJvb20=",
                    "model": "L530",
                    "type": "SMART.TAPOBULB",
                    "device_on": false,
                    "brightness": 40,
                    "color_temp": 2700,
                    "hue": 0,
                    "saturation": 100,
                    "signal_level": 3,
                    "rssi": -52
                }),
                ..Default::default()
            }),
            handshake1_calls: AtomicUsize::new(0),
            handshake2_calls: AtomicUsize::new(0),
            request_calls: AtomicUsize::new(0),
        })
    }

    /// Answer the next `count` requests with the session-expired status.
    pub fn expire_next(&self, count: usize) {
        self.state.lock().unwrap().expire_next = count;
    }

    /// Methods of all decrypted request envelopes, in order.
    pub fn methods(&self) -> Vec<String> {
        self.state.lock().unwrap().methods.clone()
    }

    /// All decrypted request envelopes, in order.
    pub fn envelopes(&self) -> Vec<Value> {
        self.state.lock().unwrap().envelopes.clone()
    }

    pub fn handshakes(&self) -> usize {
        self.handshake2_calls.load(Ordering::SeqCst)
    }

    fn handle(&self, path: &str, body: &[u8], cookie: Option<&str>) -> HttpResponse {
        let mut state = self.state.lock().unwrap();

        if path == HANDSHAKE1_PATH {
            self.handshake1_calls.fetch_add(1, Ordering::SeqCst);
            let Ok(local_seed) = <[u8; 16]>::try_from(body) else {
                return status(400);
            };
            let mut remote_seed = [0u8; 16];
            rand::rng().fill_bytes(&mut remote_seed);

            state.cookie_counter += 1;
            let session_cookie = format!("mock-{}", state.cookie_counter);
            state.pending = Some((local_seed, remote_seed, session_cookie.clone()));

            let mut body = remote_seed.to_vec();
            body.extend_from_slice(&handshake1_seed_auth_hash(
                &local_seed,
                &remote_seed,
                &self.auth_hash,
            ));
            return HttpResponse {
                status: 200,
                body,
                session_cookie: Some(session_cookie),
            };
        }

        if path == HANDSHAKE2_PATH {
            self.handshake2_calls.fetch_add(1, Ordering::SeqCst);
            let Some((local_seed, remote_seed, session_cookie)) = state.pending.take() else {
                return status(400);
            };
            let expected = handshake2_seed_auth_hash(&local_seed, &remote_seed, &self.auth_hash);
            if cookie != Some(session_cookie.as_str()) || body != expected {
                return status(401);
            }
            let keys = CipherKeys::derive(&local_seed, &remote_seed, &self.auth_hash);
            state.active = Some((keys, session_cookie));
            return status(200);
        }

        if let Some(seq) = path.strip_prefix("/app/request?seq=") {
            self.request_calls.fetch_add(1, Ordering::SeqCst);
            let Ok(seq) = seq.parse::<i32>() else {
                return status(400);
            };
            if state.expire_next > 0 {
                state.expire_next -= 1;
                state.active = None;
                return status(403);
            }
            let Some((keys, session_cookie)) = state.active.clone() else {
                return status(403);
            };
            if cookie != Some(session_cookie.as_str()) {
                return status(403);
            }

            let Ok(plaintext) = keys.open(body, seq) else {
                return status(400);
            };
            let Ok(envelope) = serde_json::from_slice::<Value>(&plaintext) else {
                return status(400);
            };
            let reply = state.apply(&envelope);
            let body = keys.seal(reply.to_string().as_bytes(), seq);
            return HttpResponse {
                status: 200,
                body,
                session_cookie: None,
            };
        }

        status(404)
    }
}

impl DeviceState {
    fn apply(&mut self, envelope: &Value) -> Value {
        let method = envelope["method"].as_str().unwrap_or_default().to_string();
        self.methods.push(method.clone());
        self.envelopes.push(envelope.clone());

        match method.as_str() {
            "get_device_info" => json!({"error_code": 0, "result": self.info}),
            "set_device_info" => {
                if let (Some(info), Some(params)) =
                    (self.info.as_object_mut(), envelope["params"].as_object())
                {
                    for (key, value) in params {
                        info.insert(key.clone(), value.clone());
                    }
                }
                json!({"error_code": 0})
            }
            _ => json!({"error_code": -1002}),
        }
    }
}

fn status(code: u16) -> HttpResponse {
    HttpResponse {
        status: code,
        body: Vec::new(),
        session_cookie: None,
    }
}

/// Transport that talks to a [`MockDevice`] in-process.
pub(crate) struct MockTransport {
    host: String,
    device: Arc<MockDevice>,
}

impl MockTransport {
    pub fn new(host: &str, device: Arc<MockDevice>) -> Self {
        Self {
            host: host.to_string(),
            device,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
        _timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        tokio::task::yield_now().await;
        Ok(self.device.handle(path, body, cookie))
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// A fake network of devices keyed by address.
///
/// Unknown addresses fail with a connection error. Every post records the
/// address and tracks how many posts are in flight at once.
#[derive(Default)]
pub(crate) struct MockNetwork {
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    probed: Mutex<Vec<String>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, address: &str, device: Arc<MockDevice>) {
        self.devices
            .lock()
            .unwrap()
            .insert(address.to_string(), device);
    }

    pub fn device(&self, address: &str) -> Option<Arc<MockDevice>> {
        self.devices.lock().unwrap().get(address).cloned()
    }

    /// Every address that received a post, in order.
    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }

    pub fn distinct_probed(&self) -> HashSet<String> {
        self.probed().into_iter().collect()
    }

    pub fn factory(self: &Arc<Self>) -> TransportFactory {
        let network = Arc::clone(self);
        Arc::new(move |host: &str| {
            Arc::new(NetworkTransport {
                host: host.to_string(),
                network: Arc::clone(&network),
            }) as Arc<dyn Transport>
        })
    }
}

struct NetworkTransport {
    host: String,
    network: Arc<MockNetwork>,
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn post(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
        _timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        let network = &self.network;
        network.probed.lock().unwrap().push(self.host.clone());

        let now = network.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        network.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        network.in_flight.fetch_sub(1, Ordering::SeqCst);

        match network.device(&self.host) {
            Some(device) => Ok(device.handle(path, body, cookie)),
            None => Err(Error::ConnectionFailed(format!("{}: unreachable", self.host))),
        }
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// Factory that routes every address to the same device.
pub(crate) fn single_device_factory(device: Arc<MockDevice>) -> TransportFactory {
    Arc::new(move |host: &str| {
        Arc::new(MockTransport::new(host, Arc::clone(&device))) as Arc<dyn Transport>
    })
}
