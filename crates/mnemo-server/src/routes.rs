use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use mnemo_core::sync::{Changes, Chunk, Graves, SyncHandler, SyncMeta, SyncSession};
use mnemo_core::{media, snapshot, Collection, SqliteDialect, TenantStore};

use crate::auth::{Session, UserStore};
use crate::config::AppConfig;
use crate::error::AppError;

/// Collections can be large; cap uploads well above the media zip bound.
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: TenantStore,
    users: Arc<UserStore>,
    tenant_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let store = TenantStore::new(&config.data_root, Arc::new(SqliteDialect));
        let users = Arc::new(UserStore::open(&config.data_root)?);
        if let Some((username, password)) = &config.default_account {
            users.ensure_user(username, password)?;
        }
        Ok(Self {
            config,
            store,
            users,
            tenant_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn require_session(&self, key: Option<&str>) -> Result<Session, AppError> {
        let key = key.ok_or_else(|| AppError::unauthorized("missing session key"))?;
        self.users
            .session(key)?
            .ok_or_else(|| AppError::unauthorized("unknown session key"))
    }

    /// One-at-a-time access per tenant; protocol steps serialize behind it.
    fn lock_for(&self, tenant: &str) -> Result<Arc<tokio::sync::Mutex<()>>, AppError> {
        let mut locks = self
            .tenant_locks
            .lock()
            .map_err(|_| AppError::internal("tenant lock table poisoned"))?;
        Ok(locks.entry(tenant.to_string()).or_default().clone())
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sync/hostKey", post(host_key))
        .route("/sync/meta", post(sync_meta))
        .route("/sync/start", post(sync_start))
        .route("/sync/applyGraves", post(apply_graves))
        .route("/sync/applyChanges", post(apply_changes))
        .route("/sync/chunk", post(chunk))
        .route("/sync/applyChunk", post(apply_chunk))
        .route("/sync/sanityCheck2", post(sanity_check2))
        .route("/sync/finish", post(finish))
        .route("/sync/upload", post(upload))
        .route("/sync/download", post(download))
        .route("/msync/begin", post(media_begin))
        .route("/msync/mediaChanges", post(media_changes))
        .route("/msync/mediaSanity", post(media_sanity))
        .route("/msync/uploadChanges", post(media_upload_changes))
        .route("/msync/downloadFiles", post(media_download_files))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Session key and compression flag travel either in the query string or as
/// multipart form fields; the payload itself is the `data` field, gzipped
/// when `c` is set.
#[derive(Debug, Default, Deserialize)]
struct KeyQuery {
    k: Option<String>,
    sk: Option<String>,
    c: Option<String>,
}

struct SyncRequest {
    key: Option<String>,
    data: Vec<u8>,
}

impl SyncRequest {
    fn json(&self) -> Result<Value, AppError> {
        if self.data.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.data)
            .map_err(|err| AppError::bad_request(format!("request body is not JSON: {err}")))
    }

    fn field<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, AppError> {
        let value = self.json()?;
        serde_json::from_value(value.get(name).cloned().unwrap_or(Value::Null))
            .map_err(|err| AppError::bad_request(format!("malformed `{name}` field: {err}")))
    }
}

async fn read_request(query: KeyQuery, mut multipart: Multipart) -> Result<SyncRequest, AppError> {
    let mut key = query.k.or(query.sk);
    let mut compressed = flag_set(query.c.as_deref());
    let mut data = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {err}")))?
    {
        let name = field.name().map(ToOwned::to_owned);
        match name.as_deref() {
            Some("c") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.to_string()))?;
                compressed = flag_set(Some(&value));
            }
            Some("k") | Some("sk") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.to_string()))?;
                if key.is_none() && !value.is_empty() {
                    key = Some(value);
                }
            }
            Some("data") => {
                data = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::bad_request(err.to_string()))?
                    .to_vec();
            }
            _ => {}
        }
    }

    if compressed && !data.is_empty() {
        let mut decoded = Vec::new();
        GzDecoder::new(data.as_slice())
            .read_to_end(&mut decoded)
            .map_err(|err| AppError::bad_request(format!("bad gzip payload: {err}")))?;
        data = decoded;
    }
    Ok(SyncRequest { key, data })
}

fn flag_set(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.is_empty() && v != "0")
}

async fn blocking<T, F>(task: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, mnemo_core::Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| AppError::internal(format!("worker task failed: {err}")))?
        .map_err(AppError::from)
}

#[derive(Debug, Deserialize)]
struct Credentials {
    u: String,
    p: String,
}

async fn host_key(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let request = read_request(query, multipart).await?;
    let credentials: Credentials = serde_json::from_value(request.json()?)
        .map_err(|_| AppError::bad_request("hostKey requires `u` and `p`"))?;
    if !state.users.authenticate(&credentials.u, &credentials.p)? {
        return Err(AppError::unauthorized("bad username or password"));
    }
    let skey = state.users.create_session(&credentials.u)?;
    tracing::info!(user = credentials.u, "opened sync session");
    Ok(Json(json!({ "key": skey, "hostNum": 1, "host_number": 2 })))
}

async fn sync_meta(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<SyncMeta>, AppError> {
    let request = read_request(query, multipart).await?;
    let session = state.require_session(request.key.as_deref())?;
    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let meta = blocking(move || {
        let col = Collection::open(&store, &session.username)?;
        mnemo_core::sync::meta(&col, &session.username)
    })
    .await?;
    Ok(Json(meta))
}

async fn sync_start(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Graves>, AppError> {
    let request = read_request(query, multipart).await?;
    let session = state.require_session(request.key.as_deref())?;
    let body = request.json()?;
    let min_usn = body.get("minUsn").and_then(Value::as_i64).unwrap_or(0);
    let client_newer = truthy(body.get("lnewer"));
    let offset = body.get("offset").and_then(Value::as_i64);

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let username = session.username.clone();
    let (graves, sync) = blocking(move || {
        let mut col = Collection::open(&store, &username)?;
        let (handler, graves) = SyncHandler::start(&mut col, min_usn, client_newer, offset)?;
        Ok((graves, handler.session()))
    })
    .await?;
    state.users.save_sync_state(&session.skey, &sync)?;
    Ok(Json(graves))
}

async fn apply_graves(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let request = read_request(query, multipart).await?;
    let (session, sync) = resumed_session(&state, &request)?;
    let graves: Graves = request.field("chunk")?;

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    blocking(move || {
        let mut col = Collection::open(&store, &session.username)?;
        SyncHandler::resume(&mut col, sync).apply_graves(&graves)
    })
    .await?;
    Ok(Json(json!({})))
}

async fn apply_changes(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Changes>, AppError> {
    let request = read_request(query, multipart).await?;
    let (session, sync) = resumed_session(&state, &request)?;
    let remote: Changes = request.field("changes")?;

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let local = blocking(move || {
        let mut col = Collection::open(&store, &session.username)?;
        SyncHandler::resume(&mut col, sync).apply_changes(remote)
    })
    .await?;
    Ok(Json(local))
}

async fn chunk(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Chunk>, AppError> {
    let request = read_request(query, multipart).await?;
    let (session, sync) = resumed_session(&state, &request)?;

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let chunk = blocking(move || {
        let mut col = Collection::open(&store, &session.username)?;
        SyncHandler::resume(&mut col, sync).chunk()
    })
    .await?;
    Ok(Json(chunk))
}

async fn apply_chunk(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let request = read_request(query, multipart).await?;
    let (session, sync) = resumed_session(&state, &request)?;
    let chunk: Chunk = request.field("chunk")?;

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    blocking(move || {
        let mut col = Collection::open(&store, &session.username)?;
        SyncHandler::resume(&mut col, sync).apply_chunk(&chunk)
    })
    .await?;
    Ok(Json(json!({})))
}

async fn sanity_check2(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let request = read_request(query, multipart).await?;
    let (session, sync) = resumed_session(&state, &request)?;
    let client: Value = request.field("client")?;

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let verdict = blocking(move || {
        let mut col = Collection::open(&store, &session.username)?;
        SyncHandler::resume(&mut col, sync).sanity_check(&client)
    })
    .await?;
    Ok(Json(verdict))
}

async fn finish(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<String, AppError> {
    let request = read_request(query, multipart).await?;
    let (session, sync) = resumed_session(&state, &request)?;

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let username = session.username.clone();
    let finished = blocking(move || {
        let mut col = Collection::open(&store, &username)?;
        SyncHandler::resume(&mut col, sync).finish()
    })
    .await?;
    tracing::info!(user = session.username, "finished sync round");
    Ok(finished.to_string())
}

async fn upload(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<String, AppError> {
    let request = read_request(query, multipart).await?;
    let session = state.require_session(request.key.as_deref())?;
    if request.data.is_empty() {
        return Err(AppError::bad_request("upload carried no collection data"));
    }

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let username = session.username.clone();
    let data = request.data;
    blocking(move || snapshot::full_upload(&store, &username, &data)).await?;
    tracing::info!(user = session.username, "adopted uploaded collection");
    Ok("OK".to_string())
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Vec<u8>, AppError> {
    let request = read_request(query, multipart).await?;
    let session = state.require_session(request.key.as_deref())?;

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let bytes = blocking(move || snapshot::full_download(&store, &session.username)).await?;
    Ok(bytes)
}

async fn media_begin(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let request = read_request(query, multipart).await?;
    let session = state.require_session(request.key.as_deref())?;
    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let username = session.username.clone();
    let usn = blocking(move || {
        let col = Collection::open(&store, &username)?;
        media::last_usn(&col)
    })
    .await?;
    Ok(Json(
        json!({ "data": { "sk": session.skey, "usn": usn }, "err": "" }),
    ))
}

async fn media_changes(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let request = read_request(query, multipart).await?;
    let session = state.require_session(request.key.as_deref())?;
    let last_usn: i64 = request.field("lastUsn")?;

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let rows = blocking(move || {
        let col = Collection::open(&store, &session.username)?;
        media::changes(&col, last_usn)
    })
    .await?;
    Ok(Json(json!({ "data": rows, "err": "" })))
}

async fn media_sanity(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let request = read_request(query, multipart).await?;
    let session = state.require_session(request.key.as_deref())?;
    let local: i64 = request.field("local")?;

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let server = blocking(move || {
        let col = Collection::open(&store, &session.username)?;
        media::count(&col)
    })
    .await?;
    let verdict = if server == local { "OK" } else { "FAILED" };
    Ok(Json(json!({ "data": verdict, "err": "" })))
}

async fn media_upload_changes(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let request = read_request(query, multipart).await?;
    let session = state.require_session(request.key.as_deref())?;
    if request.data.is_empty() {
        return Err(AppError::bad_request("media upload carried no archive"));
    }

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let data = request.data;
    let (processed, usn) = blocking(move || {
        let mut col = Collection::open(&store, &session.username)?;
        let processed = media::adopt_changes_from_zip(&mut col, &data)?;
        Ok((processed, media::last_usn(&col)?))
    })
    .await?;
    Ok(Json(json!({ "data": [processed, usn], "err": "" })))
}

async fn media_download_files(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    multipart: Multipart,
) -> Result<Vec<u8>, AppError> {
    let request = read_request(query, multipart).await?;
    let session = state.require_session(request.key.as_deref())?;
    let files: Vec<String> = request.field("files")?;

    let lock = state.lock_for(&session.username)?;
    let _guard = lock.lock_owned().await;

    let store = state.store.clone();
    let bytes = blocking(move || {
        let col = Collection::open(&store, &session.username)?;
        media::package_files_for_download(&col, &files)
    })
    .await?;
    Ok(bytes)
}

fn resumed_session(
    state: &AppState,
    request: &SyncRequest,
) -> Result<(Session, SyncSession), AppError> {
    let session = state.require_session(request.key.as_deref())?;
    let sync = session
        .sync
        .ok_or_else(|| AppError::bad_request("no sync round in progress for this session"))?;
    Ok((session, sync))
}

/// The client encodes booleans loosely; accept both JSON bools and numbers.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_flag_parsing() {
        assert!(!flag_set(None));
        assert!(!flag_set(Some("")));
        assert!(!flag_set(Some("0")));
        assert!(flag_set(Some("1")));
    }

    #[test]
    fn loose_booleans() {
        assert!(truthy(Some(&json!(true))));
        assert!(truthy(Some(&json!(1))));
        assert!(!truthy(Some(&json!(0))));
        assert!(!truthy(Some(&json!(false))));
        assert!(!truthy(None));
    }
}
