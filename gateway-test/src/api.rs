//! An in-memory API server that backs a `kube::Client`.
//!
//! Objects are stored as JSON keyed by group, resource, namespace and name.
//! Writes assign resource versions the way a real API server does, services
//! are allocated cluster IPs, and failures can be injected per verb and
//! resource.

use bytes::Bytes;
use http::{header, request::Parts, HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use kube::Resource;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value};
use std::{collections::BTreeMap, convert::Infallible, sync::Arc};
use vcluster_gateway_core::{request::query_param, RequestInfo};
use vcluster_gateway_k8s_api::{Reason, StatusError};

#[derive(Clone, Default)]
pub struct FakeApiServer {
    state: Arc<Mutex<State>>,
}

/// A request the server received.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub info: RequestInfo,
}

type React = dyn Fn(&Recorded) -> Option<Result<Value, StatusError>> + Send + Sync;

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    allocated: u32,
    failures: Vec<(Match, StatusError)>,
    reactors: Vec<(Match, Arc<React>)>,
    requests: Vec<Recorded>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    group: String,
    resource: String,
    namespace: String,
    name: String,
}

#[derive(Clone, Debug)]
struct Match {
    verb: String,
    resource: String,
}

const CREATED_AT: &str = "2024-01-01T00:00:00Z";

// === impl FakeApiServer ===

impl FakeApiServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> kube::Client {
        let server = self.clone();
        let svc = tower::service_fn(move |req: http::Request<kube::client::Body>| {
            let server = server.clone();
            async move {
                let (parts, body) = req.into_parts();
                let rsp = match body.collect().await {
                    Ok(body) => server.handle(parts, body.to_bytes()),
                    Err(error) => {
                        StatusError::bad_request(format!("failed to read body: {error}"))
                            .to_response()
                    }
                };
                Ok::<_, Infallible>(rsp.map(Full::new))
            }
        });
        kube::Client::new(svc, "default")
    }

    /// Stores an object as if it had been created.
    pub fn insert<K>(&self, obj: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut value = match serde_json::to_value(obj) {
            Ok(value) => value,
            Err(error) => panic!("object must serialize: {error}"),
        };
        value["apiVersion"] = K::api_version(&()).into();
        value["kind"] = K::kind(&()).into();
        let key = Key {
            group: K::group(&()).into_owned(),
            resource: K::plural(&()).into_owned(),
            namespace: obj.meta().namespace.clone().unwrap_or_default(),
            name: obj.meta().name.clone().unwrap_or_default(),
        };
        let mut state = self.state.lock();
        state.stamp(&mut value, true);
        state.allocate(&key, &mut value);
        state.objects.insert(key, value);
    }

    pub fn get<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let key = Key::of::<K>(namespace, name);
        let value = self.state.lock().objects.get(&key).cloned()?;
        serde_json::from_value(value).ok()
    }

    /// Changes a stored object out of band, as a controller would.
    pub fn modify<K>(&self, namespace: Option<&str>, name: &str, f: impl FnOnce(&mut K)) -> bool
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let key = Key::of::<K>(namespace, name);
        let mut state = self.state.lock();
        let Some(mut obj) = state
            .objects
            .get(&key)
            .and_then(|v| serde_json::from_value::<K>(v.clone()).ok())
        else {
            return false;
        };
        f(&mut obj);
        let Ok(mut value) = serde_json::to_value(&obj) else {
            return false;
        };
        state.stamp(&mut value, false);
        state.objects.insert(key, value);
        true
    }

    /// Fails the next request with the given verb on the given resource.
    pub fn fail_next(&self, verb: &str, resource: &str, error: StatusError) {
        self.state
            .lock()
            .failures
            .push((Match::new(verb, resource), error));
    }

    /// Answers every matching request with `f`, unless `f` returns `None`.
    pub fn react(
        &self,
        verb: &str,
        resource: &str,
        f: impl Fn(&Recorded) -> Option<Result<Value, StatusError>> + Send + Sync + 'static,
    ) {
        self.state
            .lock()
            .reactors
            .push((Match::new(verb, resource), Arc::new(f)));
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().requests.clone()
    }

    /// Requests with the given verb on the given resource.
    pub fn requests_for(&self, verb: &str, resource: &str) -> Vec<Recorded> {
        let m = Match::new(verb, resource);
        self.requests()
            .into_iter()
            .filter(|r| m.matches(&r.info))
            .collect()
    }

    fn handle(&self, parts: Parts, body: Bytes) -> http::Response<Bytes> {
        let info = RequestInfo::parse(&parts.method, parts.uri.path(), parts.uri.query());
        let recorded = Recorded {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers.clone(),
            body,
            info,
        };

        let reactors = {
            let mut state = self.state.lock();
            state.requests.push(recorded.clone());
            if let Some(i) = state
                .failures
                .iter()
                .position(|(m, _)| m.matches(&recorded.info))
            {
                let (_, error) = state.failures.remove(i);
                return error.to_response();
            }
            state
                .reactors
                .iter()
                .filter(|(m, _)| m.matches(&recorded.info))
                .map(|(_, r)| r.clone())
                .collect::<Vec<_>>()
        };
        for react in reactors {
            match react(&recorded) {
                Some(Ok(value)) => return respond(StatusCode::OK, &value),
                Some(Err(error)) => return error.to_response(),
                None => {}
            }
        }

        let res = self.state.lock().serve(&recorded);
        match res {
            Ok((status, value)) => respond(status, &value),
            Err(error) => error.to_response(),
        }
    }
}

// === impl State ===

impl State {
    fn serve(&mut self, req: &Recorded) -> Result<(StatusCode, Value), StatusError> {
        let info = &req.info;
        if !info.is_resource_request {
            return Err(StatusError::new(
                Reason::NotFound,
                format!("the server could not find the requested resource ({})", req.path),
            ));
        }
        let key = Key::from(info);
        match info.verb.as_str() {
            "get" => self
                .objects
                .get(&key)
                .cloned()
                .map(|v| (StatusCode::OK, v))
                .ok_or_else(|| not_found(&key)),
            "list" => Ok((StatusCode::OK, self.list(&key, req.query.as_deref()))),
            "create" => self.create(key, &req.body),
            "update" => self.update(&key, info.subresource == "status", &req.body),
            "patch" => self.patch(&key, content_type(&req.headers), &req.body),
            "delete" => {
                self.objects.remove(&key).ok_or_else(|| not_found(&key))?;
                Ok((
                    StatusCode::OK,
                    json!({"kind": "Status", "apiVersion": "v1", "metadata": {}, "status": "Success"}),
                ))
            }
            verb => Err(StatusError::new(
                Reason::MethodNotAllowed,
                format!("{verb} is not supported"),
            )),
        }
    }

    fn list(&self, key: &Key, query: Option<&str>) -> Value {
        let labels = query_param(query, "labelSelector").unwrap_or_default();
        let fields = query_param(query, "fieldSelector").unwrap_or_default();
        let items = self
            .objects
            .iter()
            .filter(|(k, _)| {
                k.group == key.group
                    && k.resource == key.resource
                    && (key.namespace.is_empty() || k.namespace == key.namespace)
            })
            .map(|(_, v)| v)
            .filter(|v| selects(&labels, |k| label(v, k)) && selects(&fields, |k| field(v, k)))
            .cloned()
            .collect::<Vec<_>>();
        json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": {"resourceVersion": self.version.to_string()},
            "items": items,
        })
    }

    fn create(&mut self, mut key: Key, body: &Bytes) -> Result<(StatusCode, Value), StatusError> {
        let mut value = decode(body)?;
        let meta = metadata(&mut value)?;
        if key.name.is_empty() {
            key.name = match (str_field(meta, "name"), str_field(meta, "generateName")) {
                (Some(name), _) => name.to_string(),
                (None, Some(prefix)) => format!("{prefix}{:05}", self.version + 1),
                (None, None) => {
                    return Err(StatusError::new(
                        Reason::Invalid,
                        "metadata.name: Required value: name or generateName is required",
                    ))
                }
            };
        }
        meta.insert("name".to_string(), key.name.clone().into());
        if !key.namespace.is_empty() {
            meta.insert("namespace".to_string(), key.namespace.clone().into());
        }
        if self.objects.contains_key(&key) {
            return Err(StatusError::new(
                Reason::AlreadyExists,
                format!("{} {:?} already exists", key.resource, key.name),
            ));
        }

        self.stamp(&mut value, true);
        self.allocate(&key, &mut value);
        self.objects.insert(key, value.clone());
        Ok((StatusCode::CREATED, value))
    }

    fn update(
        &mut self,
        key: &Key,
        status: bool,
        body: &Bytes,
    ) -> Result<(StatusCode, Value), StatusError> {
        let current = self.objects.get(key).cloned().ok_or_else(|| not_found(key))?;
        let mut value = decode(body)?;
        let submitted = metadata(&mut value)?
            .get("resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        if submitted.is_some_and(|rv| Some(rv.as_str()) != current["metadata"]["resourceVersion"].as_str()) {
            return Err(StatusError::conflict(format!(
                "Operation cannot be fulfilled on {} {:?}: the object has been modified",
                key.resource, key.name
            )));
        }

        let mut next = if status {
            let mut next = current.clone();
            next["status"] = value["status"].take();
            next
        } else {
            value["status"] = current["status"].clone();
            value
        };
        for field in ["uid", "creationTimestamp", "name", "namespace"] {
            next["metadata"][field] = current["metadata"][field].clone();
        }
        strip_nulls(&mut next);
        self.stamp(&mut next, false);
        self.allocate(key, &mut next);
        self.objects.insert(key.clone(), next.clone());
        Ok((StatusCode::OK, next))
    }

    fn patch(
        &mut self,
        key: &Key,
        content_type: &str,
        body: &Bytes,
    ) -> Result<(StatusCode, Value), StatusError> {
        let mut next = self.objects.get(key).cloned().ok_or_else(|| not_found(key))?;
        let patch = decode(body)?;
        if content_type.starts_with("application/json-patch+json") {
            let ops = serde_json::from_value::<json_patch::Patch>(patch)
                .map_err(|e| StatusError::bad_request(e.to_string()))?;
            json_patch::patch(&mut next, &ops)
                .map_err(|e| StatusError::new(Reason::Invalid, e.to_string()))?;
        } else {
            json_patch::merge(&mut next, &patch);
        }
        strip_nulls(&mut next);
        self.stamp(&mut next, false);
        self.allocate(key, &mut next);
        self.objects.insert(key.clone(), next.clone());
        Ok((StatusCode::OK, next))
    }

    /// Assigns a new resource version, and identity fields to new objects.
    fn stamp(&mut self, value: &mut Value, created: bool) {
        self.version += 1;
        let version = self.version;
        if let Some(meta) = value
            .as_object_mut()
            .map(|o| o.entry("metadata").or_insert_with(|| json!({})))
            .and_then(Value::as_object_mut)
        {
            meta.insert("resourceVersion".to_string(), version.to_string().into());
            if created {
                meta.entry("uid")
                    .or_insert_with(|| format!("uid-{version}").into());
                meta.entry("creationTimestamp")
                    .or_insert_with(|| CREATED_AT.into());
            }
        }
    }

    /// Services other than `ExternalName` get a cluster IP when they lack one.
    fn allocate(&mut self, key: &Key, value: &mut Value) {
        if key.group.is_empty() && key.resource == "services" {
            let spec = &mut value["spec"];
            let type_ = spec["type"].as_str().unwrap_or("ClusterIP");
            let unset = spec["clusterIP"].as_str().map_or(true, str::is_empty);
            if type_ != "ExternalName" && unset {
                self.allocated += 1;
                let ip = format!("10.96.{}.{}", self.allocated / 250, self.allocated % 250 + 1);
                spec["clusterIP"] = ip.clone().into();
                spec["clusterIPs"] = json!([ip]);
            }
        }
    }
}

// === impl Key ===

impl Key {
    fn of<K: Resource<DynamicType = ()>>(namespace: Option<&str>, name: &str) -> Self {
        Self {
            group: K::group(&()).into_owned(),
            resource: K::plural(&()).into_owned(),
            namespace: namespace.unwrap_or_default().to_string(),
            name: name.to_string(),
        }
    }
}

impl From<&RequestInfo> for Key {
    fn from(info: &RequestInfo) -> Self {
        // A field-selected list still addresses the whole collection.
        let name = if info.verb == "list" {
            String::new()
        } else {
            info.name.clone()
        };
        Self {
            group: info.api_group.clone(),
            resource: info.resource.clone(),
            namespace: info.namespace.clone(),
            name,
        }
    }
}

// === impl Match ===

impl Match {
    fn new(verb: &str, resource: &str) -> Self {
        Self {
            verb: verb.to_string(),
            resource: resource.to_string(),
        }
    }

    fn matches(&self, info: &RequestInfo) -> bool {
        info.verb == self.verb && info.resource == self.resource
    }
}

fn respond(status: StatusCode, value: &Value) -> http::Response<Bytes> {
    let mut rsp = http::Response::new(Bytes::from(value.to_string()));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    rsp
}

fn not_found(key: &Key) -> StatusError {
    StatusError::not_found(&key.group, &key.resource, &key.name)
}

fn decode(body: &Bytes) -> Result<Value, StatusError> {
    serde_json::from_slice(body).map_err(|e| StatusError::bad_request(e.to_string()))
}

fn metadata(value: &mut Value) -> Result<&mut Map<String, Value>, StatusError> {
    value
        .as_object_mut()
        .ok_or_else(|| StatusError::bad_request("object expected"))?
        .entry("metadata")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| StatusError::bad_request("metadata must be an object"))
}

fn str_field<'v>(meta: &'v Map<String, Value>, key: &str) -> Option<&'v str> {
    meta.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
}

fn strip_nulls(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        obj.retain(|_, v| !v.is_null());
        obj.values_mut().for_each(strip_nulls);
    }
}

fn label<'v>(value: &'v Value, key: &str) -> Option<&'v str> {
    value["metadata"]["labels"][key].as_str()
}

fn field<'v>(value: &'v Value, path: &str) -> Option<&'v str> {
    path.split('.')
        .try_fold(value, |v, segment| v.get(segment))
        .and_then(Value::as_str)
}

/// Evaluates equality, inequality and existence requirements.
fn selects<'v>(selector: &str, lookup: impl Fn(&str) -> Option<&'v str>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .all(|requirement| {
            if let Some((k, v)) = requirement.split_once("!=") {
                return lookup(k.trim()) != Some(v.trim());
            }
            if let Some((k, v)) = requirement
                .split_once("==")
                .or_else(|| requirement.split_once('='))
            {
                return lookup(k.trim()) == Some(v.trim());
            }
            match requirement.strip_prefix('!') {
                Some(k) => lookup(k.trim()).is_none(),
                None => lookup(requirement).is_some(),
            }
        })
}
