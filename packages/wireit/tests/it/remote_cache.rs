//! Protocol tests for the GitHub Actions artifact-cache backend, against
//! an in-process stand-in server.
//!
//! The rate-limit trip is a sticky process-wide flag, so everything runs in
//! one ordered test: round trip, reservation races, then the 429 path last.

use std::{
    collections::{HashMap, HashSet},
    fs,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use pretty_assertions::assert_eq;
use serde_json::json;

use wireit::{
    cache::{CacheLookup, GithubActionsCache, SetOutcome},
    config::{ScriptConfig, ScriptReference},
    data_dir::ScriptDataDir,
    fingerprint::Fingerprint,
    glob::PatternSet,
    manifest::{self, FileManifest},
};

use crate::temporary_package;

#[derive(Default)]
struct ServerState {
    base: Mutex<String>,
    rate_limited: AtomicBool,
    next_id: AtomicU64,
    reserved: Mutex<HashSet<(String, String)>>,
    pending: Mutex<HashMap<u64, Pending>>,
    committed: Mutex<HashMap<(String, String), Vec<u8>>>,
    uploads: AtomicU64,
    commits: AtomicU64,
}

struct Pending {
    key: String,
    version: String,
    data: Vec<u8>,
}

type Shared = Arc<ServerState>;

async fn check(State(state): State<Shared>, Query(params): Query<HashMap<String, String>>) -> Response {
    if state.rate_limited.load(Ordering::Relaxed) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    let key = params.get("keys").cloned().unwrap_or_default();
    let version = params.get("version").cloned().unwrap_or_default();
    let committed = state.committed.lock().unwrap();
    if committed.contains_key(&(key.clone(), version.clone())) {
        let base = state.base.lock().unwrap().clone();
        Json(json!({
            "archiveLocation": format!("{base}download/{key}/{version}"),
            "cacheKey": key,
        }))
        .into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveBody {
    key: String,
    version: String,
    #[allow(dead_code)]
    cache_size: u64,
}

async fn reserve(State(state): State<Shared>, Json(body): Json<ReserveBody>) -> Response {
    if state.rate_limited.load(Ordering::Relaxed) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    let pair = (body.key.clone(), body.version.clone());
    {
        let mut reserved = state.reserved.lock().unwrap();
        if reserved.contains(&pair) || state.committed.lock().unwrap().contains_key(&pair) {
            return StatusCode::CONFLICT.into_response();
        }
        reserved.insert(pair);
    }
    let id = state.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    state.pending.lock().unwrap().insert(
        id,
        Pending { key: body.key, version: body.version, data: Vec::new() },
    );
    (StatusCode::CREATED, Json(json!({ "cacheId": id }))).into_response()
}

async fn upload(
    State(state): State<Shared>,
    AxumPath(id): AxumPath<u64>,
    body: Bytes,
) -> Response {
    let mut pending = state.pending.lock().unwrap();
    let Some(entry) = pending.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    entry.data.extend_from_slice(&body);
    state.uploads.fetch_add(1, Ordering::Relaxed);
    StatusCode::NO_CONTENT.into_response()
}

async fn commit(State(state): State<Shared>, AxumPath(id): AxumPath<u64>) -> Response {
    let Some(entry) = state.pending.lock().unwrap().remove(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    state
        .committed
        .lock()
        .unwrap()
        .insert((entry.key, entry.version), entry.data);
    state.commits.fetch_add(1, Ordering::Relaxed);
    StatusCode::CREATED.into_response()
}

async fn download(
    State(state): State<Shared>,
    AxumPath((key, version)): AxumPath<(String, String)>,
) -> Response {
    match state.committed.lock().unwrap().get(&(key, version)) {
        Some(data) => (StatusCode::OK, data.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_server() -> (Shared, String) {
    let state = Shared::default();
    let router = Router::new()
        .route("/_apis/artifactcache/cache", get(check))
        .route("/_apis/artifactcache/caches", post(reserve))
        .route("/_apis/artifactcache/caches/{id}", patch(upload).post(commit))
        .route("/download/{key}/{version}", get(download))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}/", listener.local_addr().unwrap());
    *state.base.lock().unwrap() = base.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (state, base)
}

struct CachedScript {
    reference: ScriptReference,
    fingerprint: Fingerprint,
    outputs: FileManifest,
    data_dir: ScriptDataDir,
}

async fn cached_script(package: &std::path::Path) -> CachedScript {
    let config = ScriptConfig::builder()
        .reference(ScriptReference::new(package, "build"))
        .command("true".to_string())
        .files(vec![])
        .output(vec!["out".to_string(), "out/**".to_string()])
        .package_locks(vec![])
        .build();
    let fingerprint = Fingerprint::compute(&config, &[]).await.unwrap();
    let patterns = PatternSet::parse(&["out", "out/**"]).unwrap();
    let outputs = manifest::gather(package, &patterns).await.unwrap();
    CachedScript {
        data_dir: ScriptDataDir::new(&config.reference),
        reference: config.reference.clone(),
        fingerprint,
        outputs,
    }
}

#[test_log::test(tokio::test)]
async fn protocol_round_trip_races_and_rate_limit() {
    let (state, base) = start_server().await;
    let cache = GithubActionsCache::new(&base, "test-token".into(), Some("ubuntu22".into())).unwrap();

    // Round trip: store, destroy, look up, restore byte-for-byte.
    let package = temporary_package();
    fs::create_dir_all(package.path().join("out/empty")).unwrap();
    fs::write(package.path().join("out/main.js"), b"console.log(1)").unwrap();
    let script = cached_script(package.path()).await;

    let stored = cache
        .set(&script.reference, &script.fingerprint, &script.outputs, &script.data_dir)
        .await
        .unwrap();
    assert!(matches!(stored, SetOutcome::Stored), "got {stored:?}");
    assert_eq!(state.commits.load(Ordering::Relaxed), 1);
    assert!(state.uploads.load(Ordering::Relaxed) >= 1);

    fs::remove_dir_all(package.path().join("out")).unwrap();
    let lookup = cache
        .get(&script.reference, &script.fingerprint, &script.data_dir)
        .await
        .unwrap();
    let CacheLookup::Hit(hit) = lookup else {
        panic!("expected a hit, got {lookup:?}");
    };
    hit.apply().await.unwrap();
    assert_eq!(
        fs::read(package.path().join("out/main.js")).unwrap(),
        b"console.log(1)"
    );
    assert!(package.path().join("out/empty").is_dir());

    // A later producer of the same entry loses the reservation race.
    let raced = cache
        .set(&script.reference, &script.fingerprint, &script.outputs, &script.data_dir)
        .await
        .unwrap();
    assert!(matches!(raced, SetOutcome::RaceLost), "got {raced:?}");

    // Five concurrent producers: exactly one wins, one upload, one commit.
    let package_b = temporary_package();
    fs::create_dir_all(package_b.path().join("out")).unwrap();
    fs::write(package_b.path().join("out/artifact.bin"), b"payload").unwrap();
    let script_b = cached_script(package_b.path()).await;

    let uploads_before = state.uploads.load(Ordering::Relaxed);
    let commits_before = state.commits.load(Ordering::Relaxed);
    let outcomes = futures::future::join_all((0..5).map(|_| {
        let cache = cache.clone();
        let script_b = &script_b;
        async move {
            cache
                .set(&script_b.reference, &script_b.fingerprint, &script_b.outputs, &script_b.data_dir)
                .await
                .unwrap()
        }
    }))
    .await;
    let stored_count = outcomes.iter().filter(|o| matches!(o, SetOutcome::Stored)).count();
    let raced_count = outcomes.iter().filter(|o| matches!(o, SetOutcome::RaceLost)).count();
    assert_eq!((stored_count, raced_count), (1, 4), "outcomes: {outcomes:?}");
    assert_eq!(state.uploads.load(Ordering::Relaxed) - uploads_before, 1);
    assert_eq!(state.commits.load(Ordering::Relaxed) - commits_before, 1);

    // Rate limiting: the first 429 reports, everything after is a silent
    // miss or decline with no further network traffic.
    state.rate_limited.store(true, Ordering::Relaxed);
    let limited = cache
        .get(&script.reference, &script.fingerprint, &script.data_dir)
        .await
        .unwrap();
    assert!(matches!(limited, CacheLookup::RateLimited), "got {limited:?}");

    let sticky_get = cache
        .get(&script.reference, &script.fingerprint, &script.data_dir)
        .await
        .unwrap();
    assert!(matches!(sticky_get, CacheLookup::Miss), "got {sticky_get:?}");

    let commits_after = state.commits.load(Ordering::Relaxed);
    let sticky_set = cache
        .set(&script.reference, &script.fingerprint, &script.outputs, &script.data_dir)
        .await
        .unwrap();
    assert!(matches!(sticky_set, SetOutcome::Disabled), "got {sticky_set:?}");
    assert_eq!(state.commits.load(Ordering::Relaxed), commits_after);
}
