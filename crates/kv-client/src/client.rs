//! etcd v3 client
//!
//! Talks to the etcd gRPC gateway (`/v3/...`) using JSON over HTTPS.
//! Keys and values travel base64-encoded, 64-bit integers as decimal strings.
//! Requests fail over across the configured endpoints.

use crate::error::KvError;
use crate::kv_trait::{KvClientTrait, MemberClientTrait, WatchStream};
use crate::models::*;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

/// Connection settings for the etcd client
#[derive(Debug, Clone, Default)]
pub struct EtcdConfig {
    /// Client URLs, e.g. `https://10.0.0.1:2379`
    pub endpoints: Vec<String>,
    /// Username for etcd authentication
    pub username: Option<String>,
    /// Password for etcd authentication
    pub password: Option<String>,
    /// PEM encoded CA bundle used to verify the servers
    pub ca_pem: Option<Vec<u8>>,
    /// PEM encoded client certificate
    pub cert_pem: Option<Vec<u8>>,
    /// PEM encoded client private key
    pub key_pem: Option<Vec<u8>>,
    /// Per-request deadline
    pub timeout: Duration,
}

/// etcd v3 client over the JSON gateway
#[derive(Debug)]
pub struct EtcdClient {
    client: Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
    timeout: Duration,
    credentials: Option<(String, String)>,
    token: RwLock<Option<String>>,
}

impl EtcdClient {
    /// Create a client from connection settings
    ///
    /// No connection is attempted until the first request.
    pub fn new(config: EtcdConfig) -> Result<Self, KvError> {
        if config.endpoints.is_empty() {
            return Err(KvError::Unavailable("no endpoints configured".to_string()));
        }

        let mut builder = Client::builder().use_rustls_tls();
        if let Some(ca) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca)?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&config.cert_pem, &config.key_pem) {
            let mut pem = cert.clone();
            pem.push(b'\n');
            pem.extend_from_slice(key);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }
        // No global timeout: watch responses are long-lived streams.
        let client = builder.build()?;

        let credentials = match (config.username, config.password) {
            (Some(u), Some(p)) if !u.is_empty() => Some((u, p)),
            _ => None,
        };

        Ok(Self {
            client,
            endpoints: config
                .endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            current: AtomicUsize::new(0),
            timeout: if config.timeout.is_zero() {
                Duration::from_secs(2)
            } else {
                config.timeout
            },
            credentials,
            token: RwLock::new(None),
        })
    }

    /// Configured endpoints
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    async fn authenticate(&self, endpoint: &str) -> Result<Option<String>, KvError> {
        let Some((user, password)) = &self.credentials else {
            return Ok(None);
        };
        if let Some(token) = self.token.read().await.clone() {
            return Ok(Some(token));
        }

        debug!("Authenticating to etcd at {}", endpoint);
        let response = self
            .client
            .post(format!("{endpoint}/v3/auth/authenticate"))
            .timeout(self.timeout)
            .json(&json!({ "name": user, "password": password }))
            .send()
            .await?;
        let body = decode_body(response).await?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| KvError::Api("authentication response without token".to_string()))?
            .to_string();
        *self.token.write().await = Some(token.clone());
        Ok(Some(token))
    }

    /// Send a request to one endpoint, re-authenticating once on 401
    async fn post_endpoint(
        &self,
        endpoint: &str,
        path: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, KvError> {
        for attempt in 0..2 {
            let token = self.authenticate(endpoint).await?;
            let mut request = self.client.post(format!("{endpoint}{path}")).json(body);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            if let Some(token) = token {
                request = request.header("Authorization", token);
            }
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    KvError::Timeout(format!("{endpoint}{path}"))
                } else {
                    KvError::Http(e)
                }
            })?;
            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 && self.credentials.is_some() {
                *self.token.write().await = None;
                continue;
            }
            return Ok(response);
        }
        Err(KvError::Api(format!("{path}: authentication rejected")))
    }

    /// Send a request, failing over across endpoints on transport errors
    async fn post_raw(&self, path: &str, body: &Value, timeout: Option<Duration>) -> Result<reqwest::Response, KvError> {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_error = None;
        for i in 0..self.endpoints.len() {
            let idx = (start + i) % self.endpoints.len();
            let endpoint = &self.endpoints[idx];
            match self.post_endpoint(endpoint, path, body, timeout).await {
                Ok(response) => {
                    self.current.store(idx, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) if e.is_transport() => {
                    warn!("etcd endpoint {} failed: {}", endpoint, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(KvError::Unavailable(
            last_error.map_or_else(|| "no endpoints".to_string(), |e| e.to_string()),
        ))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, KvError> {
        let response = self.post_raw(path, &body, Some(self.timeout)).await?;
        decode_body(response).await
    }
}

/// Decode a unary gateway response, mapping error payloads
async fn decode_body(response: reqwest::Response) -> Result<Value, KvError> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(text);
        return Err(classify_error(status, message));
    }
    Ok(serde_json::from_str(&text)?)
}

fn classify_error(status: StatusCode, message: String) -> KvError {
    if message.contains("requested lease not found") {
        return KvError::LeaseExpired(0);
    }
    if status == StatusCode::SERVICE_UNAVAILABLE || message.contains("no leader") {
        return KvError::Unavailable(message);
    }
    if status == StatusCode::GATEWAY_TIMEOUT || message.contains("deadline exceeded") {
        return KvError::Timeout(message);
    }
    KvError::Api(format!("{status}: {message}"))
}

fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

fn decode(data: &str) -> Result<Vec<u8>, KvError> {
    STANDARD
        .decode(data)
        .map_err(|e| KvError::Decode(e.to_string()))
}

/// Accept an int64 encoded either as a JSON string or a number
fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Str(String),
        Num(i64),
    }
    match Repr::deserialize(d)? {
        Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
        Repr::Num(n) => Ok(n),
    }
}

fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Str(String),
        Num(u64),
    }
    match Repr::deserialize(d)? {
        Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
        Repr::Num(n) => Ok(n),
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireHeader {
    #[serde(default, deserialize_with = "de_i64")]
    revision: i64,
}

#[derive(Debug, Deserialize)]
struct WireKeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "de_i64")]
    create_revision: i64,
    #[serde(default, deserialize_with = "de_i64")]
    mod_revision: i64,
    #[serde(default, deserialize_with = "de_i64")]
    version: i64,
    #[serde(default, deserialize_with = "de_i64")]
    lease: i64,
}

impl WireKeyValue {
    fn into_model(self) -> Result<KeyValue, KvError> {
        let key = String::from_utf8(decode(&self.key)?).map_err(|e| KvError::Decode(e.to_string()))?;
        Ok(KeyValue {
            key,
            value: decode(&self.value)?,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
            lease: self.lease,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireRangeResponse {
    #[serde(default)]
    header: WireHeader,
    #[serde(default)]
    kvs: Vec<WireKeyValue>,
    #[serde(default, deserialize_with = "de_i64")]
    count: i64,
}

#[derive(Debug, Deserialize)]
struct WireTxnResponse {
    #[serde(default)]
    header: WireHeader,
    #[serde(default)]
    succeeded: bool,
}

#[derive(Debug, Deserialize)]
struct WireLease {
    #[serde(rename = "ID", default, deserialize_with = "de_i64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Debug, Deserialize)]
struct WireKeepAlive {
    result: Option<WireLease>,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    #[serde(rename = "ID", default, deserialize_with = "de_u64")]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(rename = "peerURLs", default)]
    peer_urls: Vec<String>,
    #[serde(rename = "clientURLs", default)]
    client_urls: Vec<String>,
}

impl From<WireMember> for Member {
    fn from(m: WireMember) -> Self {
        Member {
            id: m.id,
            name: m.name,
            peer_urls: m.peer_urls,
            client_urls: m.client_urls,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    kv: WireKeyValue,
}

#[derive(Debug, Deserialize)]
struct WireWatchResult {
    #[serde(default)]
    events: Vec<WireEvent>,
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    cancel_reason: String,
    #[serde(default, deserialize_with = "de_i64")]
    compact_revision: i64,
}

#[derive(Debug, Deserialize)]
struct WireWatchMessage {
    result: Option<WireWatchResult>,
    error: Option<Value>,
}

fn range_body(key: &str, options: &RangeOptions) -> Value {
    let mut body = json!({ "key": encode(key.as_bytes()) });
    if options.prefix {
        body["range_end"] = json!(encode(&prefix_range_end(key)));
    }
    if options.limit > 0 {
        body["limit"] = json!(options.limit.to_string());
    }
    if let Some((target, order)) = options.sort {
        body["sort_target"] = json!(match target {
            SortTarget::Key => "KEY",
            SortTarget::Create => "CREATE",
            SortTarget::Mod => "MOD",
        });
        body["sort_order"] = json!(match order {
            SortOrder::Ascend => "ASCEND",
            SortOrder::Descend => "DESCEND",
        });
    }
    if let Some(max) = options.max_create_revision {
        body["max_create_revision"] = json!(max.to_string());
    }
    body
}

fn compare_body(compare: &Compare) -> Value {
    let key = encode(compare.key().as_bytes());
    match compare {
        Compare::CreateRevision(_, n) => {
            json!({ "key": key, "result": "EQUAL", "target": "CREATE", "create_revision": n.to_string() })
        }
        Compare::ModRevision(_, n) => {
            json!({ "key": key, "result": "EQUAL", "target": "MOD", "mod_revision": n.to_string() })
        }
        Compare::Version(_, n) => {
            json!({ "key": key, "result": "EQUAL", "target": "VERSION", "version": n.to_string() })
        }
    }
}

fn op_body(op: &TxnOp) -> Value {
    match op {
        TxnOp::Put { key, value, lease } => {
            let mut put = json!({ "key": encode(key.as_bytes()), "value": encode(value) });
            if *lease != 0 {
                put["lease"] = json!(lease.to_string());
            }
            json!({ "request_put": put })
        }
        TxnOp::Delete { key, prefix } => {
            let mut del = json!({ "key": encode(key.as_bytes()) });
            if *prefix {
                del["range_end"] = json!(encode(&prefix_range_end(key)));
            }
            json!({ "request_delete_range": del })
        }
    }
}

fn parse_watch_line(line: &[u8]) -> Result<Option<Vec<WatchEvent>>, KvError> {
    let message: WireWatchMessage = serde_json::from_slice(line)?;
    if let Some(error) = message.error {
        return Err(KvError::Api(error.to_string()));
    }
    let Some(result) = message.result else {
        return Ok(None);
    };
    if result.compact_revision > 0 {
        return Err(KvError::Api(format!(
            "watch revision compacted at {}",
            result.compact_revision
        )));
    }
    if result.canceled {
        return Err(KvError::Api(format!("watch cancelled: {}", result.cancel_reason)));
    }
    if result.events.is_empty() {
        return Ok(None);
    }
    let events = result
        .events
        .into_iter()
        .map(|e| {
            let kind = match e.kind.as_deref() {
                Some("DELETE") => EventType::Delete,
                _ => EventType::Put,
            };
            Ok(WatchEvent {
                kind,
                kv: e.kv.into_model()?,
            })
        })
        .collect::<Result<Vec<_>, KvError>>()?;
    Ok(Some(events))
}

#[async_trait::async_trait]
impl KvClientTrait for EtcdClient {
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse, KvError> {
        let body = self.post("/v3/kv/range", range_body(key, &options)).await?;
        let wire: WireRangeResponse = serde_json::from_value(body)?;
        let kvs = wire
            .kvs
            .into_iter()
            .map(WireKeyValue::into_model)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RangeResponse {
            kvs,
            revision: wire.header.revision,
            count: wire.count,
        })
    }

    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnResponse, KvError> {
        let body = json!({
            "compare": compares.iter().map(compare_body).collect::<Vec<_>>(),
            "success": success.iter().map(op_body).collect::<Vec<_>>(),
            "failure": failure.iter().map(op_body).collect::<Vec<_>>(),
        });
        let wire: WireTxnResponse = serde_json::from_value(self.post("/v3/kv/txn", body).await?)?;
        Ok(TxnResponse {
            succeeded: wire.succeeded,
            revision: wire.header.revision,
        })
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<i64, KvError> {
        let body = json!({ "TTL": ttl.as_secs().max(1).to_string(), "ID": "0" });
        let wire: WireLease = serde_json::from_value(self.post("/v3/lease/grant", body).await?)?;
        debug!("Granted lease {:x} (ttl {}s)", wire.id, wire.ttl);
        Ok(wire.id)
    }

    async fn keep_alive(&self, lease: i64) -> Result<Duration, KvError> {
        let body = json!({ "ID": lease.to_string() });
        let wire: WireKeepAlive = serde_json::from_value(self.post("/v3/lease/keepalive", body).await?)?;
        match wire.result {
            Some(result) if result.ttl > 0 => Ok(Duration::from_secs(result.ttl.unsigned_abs())),
            _ => Err(KvError::LeaseExpired(lease)),
        }
    }

    async fn revoke_lease(&self, lease: i64) -> Result<(), KvError> {
        match self.post("/v3/lease/revoke", json!({ "ID": lease.to_string() })).await {
            Ok(_) | Err(KvError::LeaseExpired(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn watch(&self, key: &str, prefix: bool, start_revision: i64) -> Result<WatchStream, KvError> {
        let mut create = json!({ "key": encode(key.as_bytes()) });
        if prefix {
            create["range_end"] = json!(encode(&prefix_range_end(key)));
        }
        if start_revision > 0 {
            create["start_revision"] = json!(start_revision.to_string());
        }
        let body = json!({ "create_request": create });
        let mut response = self.post_raw("/v3/watch", &body, None).await?;
        if !response.status().is_success() {
            decode_body(response).await?;
            return Err(KvError::Api("watch rejected".to_string()));
        }

        let (tx, rx) = mpsc::channel(64);
        let key = key.to_string();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(KvError::Http(e))).await;
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match parse_watch_line(&line) {
                        Ok(Some(events)) => {
                            if tx.send(Ok(events)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
            debug!("Watch on {} ended", key);
        });
        Ok(rx)
    }
}

#[async_trait::async_trait]
impl MemberClientTrait for EtcdClient {
    async fn member_list(&self) -> Result<Vec<Member>, KvError> {
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            members: Vec<WireMember>,
        }
        let resp: Resp = serde_json::from_value(self.post("/v3/cluster/member/list", json!({})).await?)?;
        Ok(resp.members.into_iter().map(Member::from).collect())
    }

    async fn member_add(&self, peer_urls: Vec<String>) -> Result<Member, KvError> {
        #[derive(Deserialize)]
        struct Resp {
            member: WireMember,
        }
        let body = json!({ "peerURLs": peer_urls });
        let resp: Resp = serde_json::from_value(self.post("/v3/cluster/member/add", body).await?)?;
        Ok(resp.member.into())
    }

    async fn member_remove(&self, id: u64) -> Result<(), KvError> {
        self.post("/v3/cluster/member/remove", json!({ "ID": id.to_string() }))
            .await?;
        Ok(())
    }

    async fn endpoint_health(&self, endpoint: &str) -> Result<bool, KvError> {
        let response = self
            .client
            .get(format!("{}/health", endpoint.trim_end_matches('/')))
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body: Value = response.json().await?;
        Ok(matches!(body.get("health"), Some(Value::String(s)) if s == "true"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_body_prefix_and_sort() {
        let options = RangeOptions::prefix()
            .with_limit(1)
            .sorted(SortTarget::Create, SortOrder::Descend);
        let body = range_body("/cke/leader/", &options);
        assert_eq!(body["key"], encode(b"/cke/leader/"));
        assert_eq!(body["range_end"], encode(b"/cke/leader0"));
        assert_eq!(body["limit"], "1");
        assert_eq!(body["sort_target"], "CREATE");
        assert_eq!(body["sort_order"], "DESCEND");
    }

    #[test]
    fn test_compare_body_create_revision_zero() {
        let body = compare_body(&Compare::CreateRevision("/cke/cluster".into(), 0));
        assert_eq!(body["target"], "CREATE");
        assert_eq!(body["create_revision"], "0");
        assert_eq!(body["result"], "EQUAL");
    }

    #[test]
    fn test_decode_range_response_with_string_integers() {
        let raw = json!({
            "header": { "revision": "42" },
            "kvs": [{
                "key": encode(b"/cke/cluster"),
                "value": encode(b"name: test"),
                "create_revision": "3",
                "mod_revision": 40,
                "version": "2"
            }],
            "count": "1"
        });
        let wire: WireRangeResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(wire.header.revision, 42);
        let kv = wire.kvs.into_iter().next().unwrap().into_model().unwrap();
        assert_eq!(kv.key, "/cke/cluster");
        assert_eq!(kv.value, b"name: test".to_vec());
        assert_eq!(kv.create_revision, 3);
        assert_eq!(kv.mod_revision, 40);
        assert_eq!(kv.lease, 0);
    }

    #[test]
    fn test_parse_watch_line_events() {
        let line = json!({
            "result": {
                "header": { "revision": "9" },
                "events": [
                    { "kv": { "key": encode(b"/a"), "value": encode(b"1"), "mod_revision": "9" } },
                    { "type": "DELETE", "kv": { "key": encode(b"/b"), "mod_revision": "9" } }
                ]
            }
        })
        .to_string();
        let events = parse_watch_line(line.as_bytes()).unwrap().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventType::Put);
        assert_eq!(events[1].kind, EventType::Delete);
        assert_eq!(events[1].kv.key, "/b");
    }

    #[test]
    fn test_parse_watch_line_created_and_compacted() {
        let created = json!({ "result": { "header": {}, "created": true } }).to_string();
        assert!(parse_watch_line(created.as_bytes()).unwrap().is_none());

        let compacted = json!({ "result": { "compact_revision": "5", "canceled": true } }).to_string();
        assert!(parse_watch_line(compacted.as_bytes()).is_err());
    }

    #[test]
    fn test_new_requires_endpoints() {
        assert!(EtcdClient::new(EtcdConfig::default()).is_err());
    }
}
