//! In-process stand-in for the hosted backend: REST tables, the auth
//! endpoints and the realtime websocket, enough to drive `data_access`
//! end to end.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use data_access::{ClientHandle, ConnectionConfig};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

pub const API_KEY: &str = "anon-test-key";

const PROTECTED: [&str; 2] = ["users", "expenses"];

/// A REST call as the backend saw it.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: &'static str,
    pub table: String,
    pub params: Vec<(String, String)>,
    pub apikey: Option<String>,
    pub authorization: Option<String>,
    pub prefer: Option<String>,
}

impl Recorded {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone)]
struct Change {
    table: String,
    data: Value,
}

struct Account {
    password: String,
    user: Value,
}

#[derive(Default)]
struct Counters {
    joins: AtomicUsize,
    heartbeats: AtomicUsize,
    open_sockets: AtomicUsize,
}

struct MockState {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    accounts: Mutex<HashMap<String, Account>>,
    tokens: Mutex<HashSet<String>>,
    requests: Mutex<Vec<Recorded>>,
    fail_next: Mutex<Vec<StatusCode>>,
    delete_missing_is_404: AtomicBool,
    confirm_sign_ups: AtomicBool,
    silent_heartbeats: AtomicBool,
    read_gate: Mutex<Option<ReadGate>>,
    changes: broadcast::Sender<Change>,
    kick: broadcast::Sender<()>,
    counters: Counters,
}

struct ReadGate {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let (changes, _) = broadcast::channel(256);
        let (kick, _) = broadcast::channel(4);
        let state = Arc::new(MockState {
            tables: Mutex::new(HashMap::new()),
            accounts: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            fail_next: Mutex::new(Vec::new()),
            delete_missing_is_404: AtomicBool::new(false),
            confirm_sign_ups: AtomicBool::new(false),
            silent_heartbeats: AtomicBool::new(false),
            read_gate: Mutex::new(None),
            changes,
            kick,
            counters: Counters::default(),
        });

        let router = Router::new()
            .route(
                "/rest/v1/{table}",
                get(select_rows)
                    .post(insert_row)
                    .patch(update_rows)
                    .delete(delete_rows),
            )
            .route("/auth/v1/signup", post(sign_up))
            .route("/auth/v1/token", post(token))
            .route("/auth/v1/logout", post(logout))
            .route("/realtime/v1/websocket", get(realtime))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client(&self) -> ClientHandle {
        data_access::connect(&ConnectionConfig::new(self.endpoint(), API_KEY)).unwrap()
    }

    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.state
            .tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state
            .tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Recorded {
        self.requests().pop().expect("no request recorded")
    }

    /// Answers the next REST calls with these statuses, in order.
    pub fn fail_next(&self, statuses: &[StatusCode]) {
        self.state
            .fail_next
            .lock()
            .unwrap()
            .extend(statuses.iter().copied());
    }

    pub fn delete_missing_is_404(&self, enabled: bool) {
        self.state
            .delete_missing_is_404
            .store(enabled, Ordering::SeqCst);
    }

    /// Makes sign-up wait for email confirmation (no session returned).
    pub fn require_confirmation(&self, enabled: bool) {
        self.state.confirm_sign_ups.store(enabled, Ordering::SeqCst);
    }

    pub fn add_account(&self, email: &str, password: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.accounts.lock().unwrap().insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user: json!({ "id": id, "email": email, "user_metadata": {} }),
            },
        );
        id
    }

    /// Publishes a change as if a row had been committed by someone else.
    pub fn emit(&self, table: &str, kind: &str, record: Value, old_record: Value) {
        let _ = self.state.changes.send(Change {
            table: table.to_string(),
            data: change_data(table, kind, record, old_record),
        });
    }

    /// Holds the next GET until the returned sender fires. The receiver
    /// resolves once that GET has arrived.
    pub fn hold_next_read(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered, arrived) = oneshot::channel();
        let (release, released) = oneshot::channel();
        *self.state.read_gate.lock().unwrap() = Some(ReadGate {
            entered,
            release: released,
        });
        (arrived, release)
    }

    /// Keeps sockets open but stops answering heartbeats.
    pub fn silence_heartbeats(&self, silent: bool) {
        self.state.silent_heartbeats.store(silent, Ordering::SeqCst);
    }

    /// Closes every realtime socket.
    pub fn drop_connections(&self) {
        let _ = self.state.kick.send(());
    }

    pub fn joins(&self) -> usize {
        self.state.counters.joins.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> usize {
        self.state.counters.heartbeats.load(Ordering::SeqCst)
    }

    pub fn open_sockets(&self) -> usize {
        self.state.counters.open_sockets.load(Ordering::SeqCst)
    }

    /// Polls `condition` until it holds or a second has passed.
    pub async fn eventually(&self, condition: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..100 {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }
}

fn change_data(table: &str, kind: &str, record: Value, old_record: Value) -> Value {
    json!({
        "schema": "public",
        "table": table,
        "type": kind,
        "commit_timestamp": "2024-05-02T10:00:00Z",
        "record": record,
        "old_record": old_record,
    })
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

/// Records the call and applies the API key and row-level policy checks.
fn admit(
    state: &MockState,
    method: &'static str,
    table: &str,
    params: &[(String, String)],
    headers: &HeaderMap,
) -> Result<(), Response> {
    let recorded = Recorded {
        method,
        table: table.to_string(),
        params: params.to_vec(),
        apikey: header(headers, "apikey"),
        authorization: header(headers, "authorization"),
        prefer: header(headers, "prefer"),
    };
    state.requests.lock().unwrap().push(recorded.clone());

    let mut fail_next = state.fail_next.lock().unwrap();
    if !fail_next.is_empty() {
        let status = fail_next.remove(0);
        return Err(error(status, "injected failure"));
    }
    drop(fail_next);

    if recorded.apikey.as_deref() != Some(API_KEY) {
        return Err(error(StatusCode::UNAUTHORIZED, "invalid api key"));
    }
    if PROTECTED.contains(&table) {
        let token = recorded
            .authorization
            .as_deref()
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or_default();
        if !state.tokens.lock().unwrap().contains(token) {
            return Err(error(StatusCode::UNAUTHORIZED, "JWT required"));
        }
    }
    Ok(())
}

fn filters(params: &[(String, String)]) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(key, _)| key != "select" && key != "order")
        .filter_map(|(key, value)| {
            value
                .strip_prefix("eq.")
                .map(|value| (key.clone(), value.to_string()))
        })
        .collect()
}

fn matches(row: &Value, filters: &[(String, String)]) -> bool {
    filters.iter().all(|(column, expected)| match &row[column] {
        Value::String(value) => value == expected,
        Value::Null => false,
        other => other.to_string() == *expected,
    })
}

fn foreign_key(relation: &str) -> &'static str {
    match relation {
        "expense_categories" => "category_id",
        "users" => "user_id",
        "organizations" => "organization_id",
        _ => "",
    }
}

fn expand(tables: &HashMap<String, Vec<Value>>, mut row: Value, select: &str) -> Value {
    for part in select.split(',') {
        let Some(relation) = part.strip_suffix("(*)") else {
            continue;
        };
        let key = &row[foreign_key(relation)];
        let related = tables
            .get(relation)
            .and_then(|rows| rows.iter().find(|candidate| &candidate["id"] == key))
            .cloned()
            .unwrap_or(Value::Null);
        row[relation] = related;
    }
    row
}

fn sort(rows: &mut [Value], order: &str) {
    let keys: Vec<(&str, bool)> = order
        .split(',')
        .filter_map(|key| key.rsplit_once('.'))
        .map(|(column, direction)| (column, direction == "desc"))
        .collect();
    rows.sort_by(|a, b| {
        keys.iter()
            .map(|(column, descending)| {
                let ordering = a[*column].to_string().cmp(&b[*column].to_string());
                if *descending { ordering.reverse() } else { ordering }
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn wants_representation(headers: &HeaderMap) -> bool {
    header(headers, "prefer").is_some_and(|prefer| prefer.contains("return=representation"))
}

async fn select_rows(
    State(state): State<Arc<MockState>>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = admit(&state, "GET", &table, &params, &headers) {
        return response;
    }
    let gate = state.read_gate.lock().unwrap().take();
    if let Some(gate) = gate {
        let _ = gate.entered.send(());
        let _ = gate.release.await;
    }

    let tables = state.tables.lock().unwrap();
    let filters = filters(&params);
    let select = params
        .iter()
        .find(|(key, _)| key == "select")
        .map_or("*", |(_, value)| value.as_str());
    let mut rows: Vec<Value> = tables
        .get(&table)
        .map(|rows| {
            rows.iter()
                .filter(|row| matches(row, &filters))
                .map(|row| expand(&tables, row.clone(), select))
                .collect()
        })
        .unwrap_or_default();
    if let Some((_, order)) = params.iter().find(|(key, _)| key == "order") {
        sort(&mut rows, order);
    }

    Json(Value::Array(rows)).into_response()
}

async fn insert_row(
    State(state): State<Arc<MockState>>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    if let Err(response) = admit(&state, "POST", &table, &params, &headers) {
        return response;
    }

    let mut row = body;
    row.insert("id".to_string(), json!(Uuid::new_v4()));
    if table == "expenses" {
        for column in ["amount", "category_id", "expense_date", "organization_id", "user_id"] {
            if !row.contains_key(column) {
                return error(
                    StatusCode::BAD_REQUEST,
                    &format!("null value in column \"{column}\""),
                );
            }
        }
        row.entry("status").or_insert_with(|| json!("pending"));
        row.entry("description").or_insert(Value::Null);
        row.insert("created_at".to_string(), json!("2024-05-02T10:00:00Z"));
    }
    let row = Value::Object(row);

    state
        .tables
        .lock()
        .unwrap()
        .entry(table.clone())
        .or_default()
        .push(row.clone());
    let _ = state.changes.send(Change {
        table: table.clone(),
        data: change_data(&table, "INSERT", row.clone(), json!({})),
    });

    if wants_representation(&headers) {
        (StatusCode::CREATED, Json(json!([row]))).into_response()
    } else {
        StatusCode::CREATED.into_response()
    }
}

async fn update_rows(
    State(state): State<Arc<MockState>>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    Json(patch): Json<Map<String, Value>>,
) -> Response {
    if let Err(response) = admit(&state, "PATCH", &table, &params, &headers) {
        return response;
    }

    let filters = filters(&params);
    let mut updated = Vec::new();
    {
        let mut tables = state.tables.lock().unwrap();
        for row in tables.entry(table.clone()).or_default().iter_mut() {
            if !matches(row, &filters) {
                continue;
            }
            let old = row.clone();
            for (column, value) in &patch {
                row[column] = value.clone();
            }
            updated.push(row.clone());
            let _ = state.changes.send(Change {
                table: table.clone(),
                data: change_data(&table, "UPDATE", row.clone(), old),
            });
        }
    }

    if wants_representation(&headers) {
        Json(Value::Array(updated)).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn delete_rows(
    State(state): State<Arc<MockState>>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = admit(&state, "DELETE", &table, &params, &headers) {
        return response;
    }

    let filters = filters(&params);
    let mut removed = Vec::new();
    {
        let mut tables = state.tables.lock().unwrap();
        let rows = tables.entry(table.clone()).or_default();
        rows.retain(|row| {
            if matches(row, &filters) {
                removed.push(row.clone());
                false
            } else {
                true
            }
        });
    }
    for row in &removed {
        let _ = state.changes.send(Change {
            table: table.clone(),
            data: change_data(&table, "DELETE", Value::Null, json!({ "id": row["id"] })),
        });
    }

    if removed.is_empty() && state.delete_missing_is_404.load(Ordering::SeqCst) {
        return error(StatusCode::NOT_FOUND, "row not found");
    }
    if wants_representation(&headers) {
        Json(Value::Array(removed)).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

fn session(state: &MockState, user: &Value) -> Value {
    let access_token = format!("jwt-{}", Uuid::new_v4());
    state.tokens.lock().unwrap().insert(access_token.clone());
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": 3600,
        "expires_at": 4_102_444_800i64,
        "refresh_token": "refresh",
        "user": user,
    })
}

async fn sign_up(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if header(&headers, "apikey").as_deref() != Some(API_KEY) {
        return error(StatusCode::UNAUTHORIZED, "invalid api key");
    }
    let email = body["email"].as_str().unwrap_or_default().to_string();
    let password = body["password"].as_str().unwrap_or_default().to_string();
    if password.len() < 6 {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "msg": "Password should be at least 6 characters" })),
        )
            .into_response();
    }

    let mut accounts = state.accounts.lock().unwrap();
    if accounts.contains_key(&email) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "msg": "User already registered" })),
        )
            .into_response();
    }
    let user = json!({
        "id": Uuid::new_v4(),
        "email": email,
        "user_metadata": body["data"],
    });
    accounts.insert(
        email,
        Account {
            password,
            user: user.clone(),
        },
    );
    drop(accounts);

    if state.confirm_sign_ups.load(Ordering::SeqCst) {
        Json(user).into_response()
    } else {
        Json(session(&state, &user)).into_response()
    }
}

async fn token(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    if params.get("grant_type").map(String::as_str) != Some("password") {
        return error(StatusCode::BAD_REQUEST, "unsupported grant type");
    }
    let email = body["email"].as_str().unwrap_or_default();
    let password = body["password"].as_str().unwrap_or_default();

    let user = {
        let accounts = state.accounts.lock().unwrap();
        match accounts.get(email) {
            Some(account) if account.password == password => account.user.clone(),
            _ => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "invalid_grant",
                        "error_description": "Invalid login credentials"
                    })),
                )
                    .into_response();
            }
        }
    };
    Json(session(&state, &user)).into_response()
}

async fn logout(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    let token = header(&headers, "authorization")
        .and_then(|value| value.strip_prefix("Bearer ").map(str::to_string))
        .unwrap_or_default();
    if state.tokens.lock().unwrap().remove(&token) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error(StatusCode::UNAUTHORIZED, "invalid token")
    }
}

async fn realtime(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.get("apikey").map(String::as_str) != Some(API_KEY) {
        return error(StatusCode::UNAUTHORIZED, "invalid api key");
    }
    ws.on_upgrade(move |socket| channel(socket, state))
}

fn frame(topic: &str, event: &str, payload: Value, reference: Value) -> Message {
    let frame = json!({
        "topic": topic,
        "event": event,
        "payload": payload,
        "ref": reference,
    });
    Message::Text(frame.to_string().into())
}

async fn channel(socket: WebSocket, state: Arc<MockState>) {
    state.counters.open_sockets.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = socket.split();
    let mut changes = state.changes.subscribe();
    let mut kick = state.kick.subscribe();
    let mut joined: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            incoming = source.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                let topic = request["topic"].as_str().unwrap_or_default().to_string();
                let reference = request["ref"].clone();
                let table = topic.trim_start_matches("realtime:public:").to_string();
                let reply = match request["event"].as_str() {
                    Some("phx_join") => {
                        joined.insert(table);
                        state.counters.joins.fetch_add(1, Ordering::SeqCst);
                        frame(&topic, "phx_reply", json!({ "status": "ok", "response": {} }), reference)
                    }
                    Some("phx_leave") => {
                        joined.remove(&table);
                        frame(&topic, "phx_reply", json!({ "status": "ok", "response": {} }), reference)
                    }
                    Some("heartbeat") => {
                        state.counters.heartbeats.fetch_add(1, Ordering::SeqCst);
                        if state.silent_heartbeats.load(Ordering::SeqCst) {
                            continue;
                        }
                        frame("phoenix", "phx_reply", json!({ "status": "ok", "response": {} }), reference)
                    }
                    _ => continue,
                };
                if sink.send(reply).await.is_err() {
                    break;
                }
            }
            change = changes.recv() => {
                let Ok(change) = change else {
                    continue;
                };
                if !joined.contains(&change.table) {
                    continue;
                }
                let topic = format!("realtime:public:{}", change.table);
                let message = frame(&topic, "postgres_changes", json!({ "data": change.data, "ids": [1] }), Value::Null);
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            _ = kick.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.counters.open_sockets.fetch_sub(1, Ordering::SeqCst);
}
