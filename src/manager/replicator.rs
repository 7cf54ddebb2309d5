//! 复制任务配置与去重身份。
//!
//! 复制线协议不在本 crate 范围内：`Replicator` 只维护生命周期（Idle → Active → Stopped），
//! Manager 依据规范化后的配置保证同一身份最多一个活动实例。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{watch, Notify};

use super::is_valid_database_name;
use crate::core::{Result, ViewError};

const KNOWN_KEYS: &[&str] = &[
    "source",
    "target",
    "continuous",
    "create_target",
    "filter",
    "query_params",
    "doc_ids",
    "auth",
    "cancel",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEndpoint {
    /// 规范化后的 URL（不含 userinfo）
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub auth: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Local(String),
    Remote(RemoteEndpoint),
}

impl Endpoint {
    pub fn is_local(&self) -> bool {
        matches!(self, Endpoint::Local(_))
    }

    fn canonical(&self) -> Value {
        match self {
            Endpoint::Local(name) => Value::String(name.clone()),
            Endpoint::Remote(r) => {
                let mut m = Map::new();
                m.insert("url".into(), Value::String(r.url.clone()));
                if !r.headers.is_empty() {
                    let h: Map<String, Value> = r
                        .headers
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect();
                    m.insert("headers".into(), Value::Object(h));
                }
                if let Some(a) = &r.auth {
                    m.insert("auth".into(), a.clone());
                }
                Value::Object(m)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 本地 -> 远端
    Push,
    /// 远端 -> 本地
    Pull,
}

/// 解析并校验过的复制配置
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorConfig {
    pub source: Endpoint,
    pub target: Endpoint,
    pub continuous: bool,
    pub create_target: bool,
    pub filter: Option<String>,
    pub query_params: Option<Map<String, Value>>,
    /// 已排序去重
    pub doc_ids: Option<Vec<String>>,
    /// 不参与身份
    pub cancel: bool,
}

fn bad(msg: impl Into<String>) -> ViewError {
    ViewError::bad_request(msg)
}

fn opt_bool(props: &Map<String, Value>, key: &str) -> Result<bool> {
    match props.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(bad(format!("{} must be a boolean, got {}", key, other))),
    }
}

fn opt_object<'a>(props: &'a Map<String, Value>, key: &str) -> Result<Option<&'a Map<String, Value>>> {
    match props.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(m)) => Ok(Some(m)),
        Some(other) => Err(bad(format!("{} must be an object, got {}", key, other))),
    }
}

/// 把 auth 对象合并进端点已有的 auth（顶层 auth 覆盖同名键）
fn merge_auth(into: &mut Option<Value>, extra: &Map<String, Value>) {
    let mut base = match into.take() {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };
    for (k, v) in extra {
        match (base.get_mut(k), v) {
            (Some(Value::Object(dst)), Value::Object(src)) => {
                for (k2, v2) in src {
                    dst.insert(k2.clone(), v2.clone());
                }
            }
            _ => {
                base.insert(k.clone(), v.clone());
            }
        }
    }
    *into = Some(Value::Object(base));
}

/// 规范化 http(s) URL：scheme / host 小写，去默认端口，去尾部 `/`，拆出 userinfo
pub fn normalize_url(raw: &str) -> Result<(String, Option<(String, Option<String>)>)> {
    let (scheme, rest) = raw
        .split_once("://")
        .ok_or_else(|| bad(format!("not a URL: {:?}", raw)))?;
    let scheme = scheme.to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "http" => "80",
        "https" => "443",
        _ => return Err(bad(format!("unsupported URL scheme {:?}", scheme))),
    };

    let split = rest.find(|c| matches!(c, '/' | '?' | '#')).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(split);
    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((u, h)) => (Some(u), h),
        None => (None, authority),
    };
    if hostport.is_empty() {
        return Err(bad(format!("URL has no host: {:?}", raw)));
    }

    // IPv6 字面量 [::1]:port
    let (host, port) = if hostport.starts_with('[') {
        match hostport.find(']') {
            Some(end) => {
                let host = &hostport[..=end];
                let port = hostport[end + 1..].strip_prefix(':');
                (host, port)
            }
            None => return Err(bad(format!("bad IPv6 host in {:?}", raw))),
        }
    } else {
        match hostport.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (hostport, None),
        }
    };
    if let Some(p) = port {
        if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad(format!("bad port in {:?}", raw)));
        }
    }

    let tail = tail.split('#').next().unwrap_or("");
    let (path, query) = match tail.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (tail, None),
    };
    let path = path.trim_end_matches('/');

    let mut url = format!("{}://{}", scheme, host.to_ascii_lowercase());
    if let Some(p) = port.filter(|p| *p != default_port) {
        url.push(':');
        url.push_str(p);
    }
    url.push_str(path);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }

    let user = userinfo.filter(|u| !u.is_empty()).map(|u| match u.split_once(':') {
        Some((name, pass)) => (name.to_string(), Some(pass.to_string())),
        None => (u.to_string(), None),
    });
    Ok((url, user))
}

fn parse_endpoint(key: &str, v: Option<&Value>) -> Result<Endpoint> {
    let (url, headers, auth) = match v {
        None | Some(Value::Null) => return Err(bad(format!("{} is required", key))),
        Some(Value::String(s)) => (s.as_str(), None, None),
        Some(Value::Object(m)) => {
            let url = m
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| bad(format!("{}.url must be a string", key)))?;
            let headers = opt_object(m, "headers")?;
            let auth = opt_object(m, "auth")?;
            (url, headers, auth)
        }
        Some(other) => return Err(bad(format!("{} must be a string or object, got {}", key, other))),
    };

    if url.contains("://") {
        let (normalized, user) = normalize_url(url)?;
        let mut header_map = BTreeMap::new();
        if let Some(h) = headers {
            for (k, v) in h {
                let v = v
                    .as_str()
                    .ok_or_else(|| bad(format!("{}.headers.{} must be a string", key, k)))?;
                header_map.insert(k.clone(), v.to_string());
            }
        }
        let mut auth_value = None;
        if let Some(a) = auth {
            merge_auth(&mut auth_value, a);
        }
        if let Some((name, pass)) = user {
            let mut basic = Map::new();
            basic.insert("username".into(), Value::String(name));
            if let Some(p) = pass {
                basic.insert("password".into(), Value::String(p));
            }
            let mut extra = Map::new();
            extra.insert("basic".into(), Value::Object(basic));
            merge_auth(&mut auth_value, &extra);
        }
        return Ok(Endpoint::Remote(RemoteEndpoint {
            url: normalized,
            headers: header_map,
            auth: auth_value,
        }));
    }

    if headers.is_some() || auth.is_some() {
        return Err(bad(format!("{}: headers/auth only apply to remote endpoints", key)));
    }
    if !is_valid_database_name(url) {
        return Err(bad(format!("{} is neither a database name nor a URL: {:?}", key, url)));
    }
    Ok(Endpoint::Local(url.to_string()))
}

impl ReplicatorConfig {
    /// 结构与类型校验；不访问任何数据库
    pub fn parse(properties: &Value) -> Result<Self> {
        let props = properties
            .as_object()
            .ok_or_else(|| bad("replication properties must be a JSON object"))?;
        for k in props.keys().filter(|k| !KNOWN_KEYS.contains(&k.as_str())) {
            tracing::debug!("Ignoring unknown replication property {:?}", k);
        }

        let mut source = parse_endpoint("source", props.get("source"))?;
        let mut target = parse_endpoint("target", props.get("target"))?;
        if source.is_local() == target.is_local() {
            return Err(bad("exactly one of source and target must be a local database"));
        }

        let continuous = opt_bool(props, "continuous")?;
        let create_target = opt_bool(props, "create_target")?;
        let cancel = opt_bool(props, "cancel")?;

        let filter = match props.get("filter") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(other) => return Err(bad(format!("filter must be a non-empty string, got {}", other))),
        };
        let query_params = opt_object(props, "query_params")?.cloned();
        let doc_ids = match props.get("doc_ids") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => {
                let mut ids = Vec::with_capacity(items.len());
                for it in items {
                    let id = it
                        .as_str()
                        .ok_or_else(|| bad(format!("doc_ids must contain strings, got {}", it)))?;
                    ids.push(id.to_string());
                }
                ids.sort();
                ids.dedup();
                Some(ids)
            }
            Some(other) => return Err(bad(format!("doc_ids must be an array, got {}", other))),
        };
        if filter.is_some() && doc_ids.is_some() {
            return Err(bad("filter and doc_ids are mutually exclusive"));
        }
        if query_params.is_some() && filter.is_none() {
            return Err(bad("query_params requires filter"));
        }

        // 顶层 auth 归入远端端点
        if let Some(a) = opt_object(props, "auth")? {
            for ep in [&mut source, &mut target] {
                if let Endpoint::Remote(r) = ep {
                    merge_auth(&mut r.auth, a);
                }
            }
        }

        Ok(Self {
            source,
            target,
            continuous,
            create_target,
            filter,
            query_params,
            doc_ids,
            cancel,
        })
    }

    pub fn direction(&self) -> Direction {
        if self.source.is_local() {
            Direction::Push
        } else {
            Direction::Pull
        }
    }

    pub fn local_database(&self) -> &str {
        match (&self.source, &self.target) {
            (Endpoint::Local(n), _) | (_, Endpoint::Local(n)) => n,
            _ => "",
        }
    }

    pub fn remote(&self) -> Option<&RemoteEndpoint> {
        match (&self.source, &self.target) {
            (Endpoint::Remote(r), _) | (_, Endpoint::Remote(r)) => Some(r),
            _ => None,
        }
    }

    /// 规范形式：默认值补齐、键有序（serde_json Map 为 BTreeMap）
    pub fn canonical(&self) -> Value {
        let mut m = Map::new();
        m.insert("source".into(), self.source.canonical());
        m.insert("target".into(), self.target.canonical());
        m.insert("continuous".into(), Value::Bool(self.continuous));
        m.insert("create_target".into(), Value::Bool(self.create_target));
        m.insert(
            "filter".into(),
            self.filter.clone().map(Value::String).unwrap_or(Value::Null),
        );
        m.insert(
            "query_params".into(),
            self.query_params.clone().map(Value::Object).unwrap_or(Value::Null),
        );
        m.insert(
            "doc_ids".into(),
            self.doc_ids
                .as_ref()
                .map(|ids| Value::Array(ids.iter().cloned().map(Value::String).collect()))
                .unwrap_or(Value::Null),
        );
        Value::Object(m)
    }
}

/// 规范 JSON 的 xxh3；只用于快速比较，命中后仍做完整比较
pub fn identity_of(canonical: &Value) -> u64 {
    xxhash_rust::xxh3::xxh3_64(canonical.to_string().as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Idle,
    Active,
    Stopped,
}

/// 后台复制任务句柄
pub struct Replicator {
    config: ReplicatorConfig,
    canonical: Value,
    identity: u64,
    state: watch::Sender<ReplicatorState>,
    stop: Arc<Notify>,
}

impl Replicator {
    pub(crate) fn new(config: ReplicatorConfig) -> Arc<Self> {
        let canonical = config.canonical();
        let identity = identity_of(&canonical);
        let (state, _) = watch::channel(ReplicatorState::Idle);
        Arc::new(Self {
            config,
            canonical,
            identity,
            state,
            stop: Arc::new(Notify::new()),
        })
    }

    pub(crate) fn start(self: &Arc<Self>, runtime: &tokio::runtime::Handle) {
        self.state.send_replace(ReplicatorState::Active);
        tracing::info!(
            "Replicator started: {:016x} {:?} {} continuous={}",
            self.identity,
            self.config.direction(),
            self.config.local_database(),
            self.config.continuous
        );
        let stop = self.stop.clone();
        let id = self.identity;
        runtime.spawn(async move {
            stop.notified().await;
            tracing::info!("Replicator stopped: {:016x}", id);
        });
    }

    /// 幂等
    pub fn stop(&self) {
        let prev = self.state.send_replace(ReplicatorState::Stopped);
        if prev != ReplicatorState::Stopped {
            // notify_one 会保存一个 permit，任务稍后开始等待也能收到
            self.stop.notify_one();
        }
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ReplicatorState::Active
    }

    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ReplicatorState::Stopped).await;
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn canonical(&self) -> &Value {
        &self.canonical
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub(crate) fn matches(&self, canonical: &Value, identity: u64) -> bool {
        self.identity == identity && &self.canonical == canonical
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("identity", &format_args!("{:016x}", self.identity))
            .field("state", &self.state())
            .field("local", &self.config.local_database())
            .finish()
    }
}
