// ===============================
// src/server.rs (relay HTTP transport)
// ===============================
//
//   POST /queue/add          enqueue one trade event (JSON body)
//   GET  /queue/read         ?accountId=&total=&buy=&sell=   dequeue for a follower
//   POST /positions/report   {accountId,total,buy,sell[,side]}
//   GET  /positions          every reported snapshot
//   GET  /queue/stats        [?accountId=]
//   GET  /queue/depth        ?accountId=<follower>
//   GET  /queue/peek         ?accountId=
//   POST /queue/clear        [?accountId=]
//   GET  /health
//   GET  /metrics
//
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use hyper::body::to_bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::AddrIncoming;
use hyper::server::Builder;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::domain::{lenient_id, PositionCounts, PositionSide, WireEvent};
use crate::error::RelayError;
use crate::metrics::encode_metrics;
use crate::positions::{PositionLedger, ReconcileOutcome};
use crate::recorder::{AuditRecord, Recorder};
use crate::router::MessageRouter;

pub struct RelayState {
    pub router: MessageRouter,
    pub ledger: PositionLedger,
    pub recorder: Recorder,
    pub clock: Arc<dyn Clock>,
}

pub async fn serve(
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), hyper::Error> {
    let builder = Server::try_bind(&addr)?;
    info!(%addr, "relay listening");
    run(builder, state, shutdown).await
}

pub async fn run(
    builder: Builder<AddrIncoming>,
    state: Arc<RelayState>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(req, state).await) }
            }))
        }
    });
    builder.serve(make_svc).with_graceful_shutdown(shutdown).await
}

pub async fn route(req: Request<Body>, state: Arc<RelayState>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let query = parse_query(parts.uri.query());

    match (parts.method, parts.uri.path()) {
        (Method::POST, "/queue/add") => {
            let bytes = match to_bytes(body).await {
                Ok(b) => b,
                Err(e) => return bad_request(format!("failed to read request body: {e}")),
            };
            match serde_json::from_slice::<WireEvent>(&bytes) {
                Ok(wire) => handle_enqueue(wire, &state),
                Err(e) => bad_request(format!("invalid JSON payload: {e}")),
            }
        }
        (Method::GET, "/queue/read") => handle_dequeue(&query, &state),
        (Method::POST, "/positions/report") => {
            let bytes = match to_bytes(body).await {
                Ok(b) => b,
                Err(e) => return bad_request(format!("failed to read request body: {e}")),
            };
            match serde_json::from_slice::<PositionReport>(&bytes) {
                Ok(report) => handle_position_report(report, &state),
                Err(e) => bad_request(format!("invalid JSON payload: {e}")),
            }
        }
        (Method::GET, "/positions") => {
            let snapshots: Vec<Value> = state
                .ledger
                .all_snapshots()
                .into_iter()
                .map(|(side, account, snap)| json!({ "side": side, "accountId": account, "snapshot": snap }))
                .collect();
            json_response(StatusCode::OK, json!({ "success": true, "positions": snapshots }))
        }
        (Method::GET, "/queue/depth") => {
            let follower = query.get("accountId").map(|s| s.trim()).filter(|s| !s.is_empty());
            let Some(follower) = follower else {
                return relay_error(&RelayError::MissingAccountId, None);
            };
            match state.router.queue_depth(follower) {
                Ok(n) => json_response(
                    StatusCode::OK,
                    json!({ "success": true, "accountId": follower, "queueSize": n }),
                ),
                Err(e) => relay_error(&e, Some(follower)),
            }
        }
        (Method::GET, "/queue/stats") => {
            let stats = state.router.stats(query.get("accountId").map(String::as_str));
            json_response(StatusCode::OK, json!({ "success": true, "stats": stats }))
        }
        (Method::GET, "/queue/peek") => match query.get("accountId") {
            Some(account) => {
                let head = state.router.peek(account).map(|ev| ev.to_wire());
                json_response(
                    StatusCode::OK,
                    json!({ "success": true, "data": head, "queueSize": state.router.queue_len(account) }),
                )
            }
            None => relay_error(&RelayError::MissingAccountId, None),
        },
        (Method::POST, "/queue/clear") => {
            let cleared = state.router.clear(query.get("accountId").map(String::as_str));
            json_response(StatusCode::OK, json!({ "success": true, "cleared": cleared }))
        }
        (Method::GET, "/health") => json_response(
            StatusCode::OK,
            json!({
                "status": "OK",
                "timestamp": state.clock.now().to_rfc3339(),
                "service": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }),
        ),
        (Method::GET, "/metrics") => {
            let mut rsp = Response::new(Body::from(encode_metrics()));
            rsp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
            rsp
        }
        _ => json_response(StatusCode::NOT_FOUND, json!({ "success": false, "error": "not found" })),
    }
}

fn handle_enqueue(wire: WireEvent, state: &RelayState) -> Response<Body> {
    let account = wire.account_id.clone();
    match state.router.enqueue(wire) {
        Ok(done) => {
            state.recorder.record(AuditRecord::Enqueued {
                ts: state.clock.now(),
                key: done.key.clone(),
                queue_size: done.queue_size,
                event: done.event.to_wire(),
            });
            json_response(
                StatusCode::OK,
                json!({ "success": true, "queueSize": done.queue_size, "accountId": done.account_id }),
            )
        }
        Err(RelayError::DuplicateMessage { key }) => {
            let queue_size = account.as_deref().map(|a| state.router.queue_len(a.trim())).unwrap_or(0);
            json_response(
                StatusCode::OK,
                json!({
                    "success": false,
                    "duplicate": true,
                    "message": format!("duplicate message {key} not added"),
                    "queueSize": queue_size,
                    "accountId": account,
                }),
            )
        }
        Err(e) => relay_error(&e, account.as_deref()),
    }
}

fn handle_dequeue(query: &HashMap<String, String>, state: &RelayState) -> Response<Body> {
    let follower = query.get("accountId").map(|s| s.trim()).filter(|s| !s.is_empty());

    // Reconciliation rides along with the poll and never changes its result.
    // Unknown followers leave no snapshot or metric series behind.
    if let (Some(follower), Some(counts)) = (follower, counts_from_query(query)) {
        let accounts = state.router.accounts();
        if accounts.authorize_following(follower).is_ok() && accounts.sources_for(follower).is_ok() {
            state.ledger.report_position(PositionSide::Following, follower, counts);
            if let ReconcileOutcome::Alerted(alert) = state.ledger.compare_and_alert(follower, counts) {
                state.recorder.record(AuditRecord::Alert {
                    ts: alert.at,
                    follower: follower.to_string(),
                    subject: alert.subject(),
                    body: alert.body(),
                });
            }
        }
    }

    match state.router.dequeue(follower) {
        Ok(d) => {
            let data = d.event.as_ref().map(|ev| ev.to_wire());
            if let Some(wire) = &data {
                state.recorder.record(AuditRecord::Dequeued {
                    ts: state.clock.now(),
                    follower: d.follower.clone(),
                    event: wire.clone(),
                });
            }
            json_response(
                StatusCode::OK,
                json!({
                    "success": true,
                    "data": data,
                    "queueSize": d.queue_size,
                    "mt5AccountId": d.follower,
                    "allowedAccounts": d.sources,
                }),
            )
        }
        Err(e) => relay_error(&e, follower),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionReport {
    #[serde(default, deserialize_with = "lenient_id")]
    account_id: Option<String>,
    total: u32,
    buy: u32,
    sell: u32,
    #[serde(default)]
    side: Option<PositionSide>,
}

fn handle_position_report(report: PositionReport, state: &RelayState) -> Response<Body> {
    let account = report.account_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let Some(account) = account else {
        return relay_error(&RelayError::MissingAccountId, None);
    };
    let side = report.side.unwrap_or(PositionSide::Originating);
    let accounts = state.router.accounts();
    let auth = match side {
        PositionSide::Originating => accounts.authorize_originating(account),
        PositionSide::Following => accounts.authorize_following(account),
    };
    if let Err(e) = auth {
        warn!(%account, ?side, "position report from unauthorized account");
        return relay_error(&e, Some(account));
    }
    let counts = PositionCounts::new(report.total, report.buy, report.sell);
    state.ledger.report_position(side, account, counts);
    json_response(StatusCode::OK, json!({ "success": true, "accountId": account }))
}

fn counts_from_query(query: &HashMap<String, String>) -> Option<PositionCounts> {
    let field = |k: &str| query.get(k).and_then(|v| v.trim().parse::<u32>().ok());
    Some(PositionCounts::new(field("total")?, field("buy")?, field("sell")?))
}

fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    raw.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn relay_error(e: &RelayError, account: Option<&str>) -> Response<Body> {
    let allowed: &[String] = match e {
        RelayError::Unauthorized { allowed, .. } => allowed.as_slice(),
        _ => &[],
    };
    if e.status() == StatusCode::FORBIDDEN {
        warn!(account = account.unwrap_or("-"), error = %e, "request rejected");
    }
    json_response(
        e.status(),
        json!({
            "success": false,
            "error": e.to_string(),
            "accountId": account,
            "allowedAccounts": allowed,
        }),
    )
}

fn bad_request(msg: String) -> Response<Body> {
    json_response(StatusCode::BAD_REQUEST, json!({ "success": false, "error": msg }))
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    let bytes = match serde_json::to_vec(&body) {
        Ok(b) => b,
        Err(e) => {
            error!(?e, "response encode failed");
            b"{\"success\":false}".to_vec()
        }
    };
    let mut rsp = Response::new(Body::from(bytes));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    rsp
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::accounts::AccountTable;
    use crate::clock::ManualClock;
    use crate::notifier::RecordingNotifier;
    use crate::positions::ReconcileCfg;
    use crate::router::RouterCfg;
    use chrono::{TimeZone, Utc};

    pub(crate) struct Harness {
        pub state: Arc<RelayState>,
        pub notifier: Arc<RecordingNotifier>,
    }

    pub(crate) fn harness(origin_allow: &[&str]) -> Harness {
        harness_with(origin_allow, &[])
    }

    fn harness_with(origin_allow: &[&str], follow_allow: &[&str]) -> Harness {
        let mut mapping = HashMap::new();
        mapping.insert("6098214".to_string(), vec!["7412666".to_string()]);
        mapping.insert("6098215".to_string(), vec!["7412666".to_string()]);
        let accounts = Arc::new(AccountTable::new(
            origin_allow.iter().map(|s| s.to_string()).collect(),
            follow_allow.iter().map(|s| s.to_string()).collect(),
            mapping,
        ));
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 12, 4, 16, 11, 12).unwrap()));
        let notifier = Arc::new(RecordingNotifier::default());
        let router = MessageRouter::new(accounts.clone(), clock.clone(), RouterCfg::default());
        let ledger = PositionLedger::new(accounts, clock.clone(), notifier.clone(), ReconcileCfg::default());
        let state = Arc::new(RelayState { router, ledger, recorder: Recorder::disabled(), clock });
        Harness { state, notifier }
    }

    async fn call(state: &Arc<RelayState>, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
        let req = Request::builder().method(method).uri(uri).body(body).unwrap();
        let rsp = route(req, state.clone()).await;
        let status = rsp.status();
        let bytes = to_bytes(rsp.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn open_body(ticket: i64) -> Value {
        json!({
            "accountId": 7412666,
            "action": "open",
            "orderType": "buy",
            "symbol": "EURUSD",
            "volume": 0.1,
            "price": 1.0845,
            "ticket": ticket,
            "timestamp": "2025.12.04 18:11:10"
        })
    }

    #[tokio::test]
    async fn add_then_read() {
        let h = harness(&["7412666"]);
        let (status, body) = call(&h.state, Method::POST, "/queue/add", Some(open_body(1001))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["queueSize"], 1);
        assert_eq!(body["accountId"], "7412666");

        let (status, body) = call(&h.state, Method::GET, "/queue/read?accountId=6098214", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ticket"], 1001);
        assert_eq!(body["data"]["originTimeUtc"], "2025-12-04T16:11:10Z");
        assert_eq!(body["queueSize"], 0);
        assert_eq!(body["mt5AccountId"], "6098214");
        assert_eq!(body["allowedAccounts"], json!(["7412666"]));

        let (_, body) = call(&h.state, Method::GET, "/queue/read?accountId=6098214", None).await;
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn rejections_carry_diagnostics() {
        let h = harness(&["7412666"]);
        let mut stranger = open_body(1);
        stranger["accountId"] = json!("999");
        let (status, body) = call(&h.state, Method::POST, "/queue/add", Some(stranger)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["accountId"], "999");
        assert_eq!(body["allowedAccounts"], json!(["7412666"]));

        let (status, _) = call(&h.state, Method::POST, "/queue/add", Some(json!({ "action": "open" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h.state, Method::GET, "/queue/read", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&h.state, Method::GET, "/queue/read?accountId=42", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn following_allow_list_gates_reads_and_reports() {
        let h = harness_with(&["7412666"], &["6098214"]);
        call(&h.state, Method::POST, "/queue/add", Some(open_body(1))).await;

        // mapped but not allowed to follow
        let (status, body) =
            call(&h.state, Method::GET, "/queue/read?accountId=6098215&total=3&buy=3&sell=0", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["accountId"], "6098215");
        assert_eq!(body["allowedAccounts"], json!(["6098214"]));
        assert!(h.state.ledger.snapshot(PositionSide::Following, "6098215").is_none());
        assert_eq!(h.state.router.queue_len("7412666"), 1);

        let report = json!({ "accountId": "6098215", "total": 3, "buy": 3, "sell": 0, "side": "following" });
        let (status, body) = call(&h.state, Method::POST, "/positions/report", Some(report)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["allowedAccounts"], json!(["6098214"]));
        assert!(h.state.ledger.snapshot(PositionSide::Following, "6098215").is_none());

        let report = json!({ "accountId": "999", "total": 1, "buy": 1, "sell": 0 });
        let (status, body) = call(&h.state, Method::POST, "/positions/report", Some(report)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["allowedAccounts"], json!(["7412666"]));
        assert!(h.state.ledger.snapshot(PositionSide::Originating, "999").is_none());
        assert_eq!(h.notifier.count(), 0);

        let (status, body) = call(&h.state, Method::GET, "/queue/read?accountId=6098214", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ticket"], 1);
    }

    #[tokio::test]
    async fn unmapped_follower_counts_are_not_recorded() {
        let h = harness(&[]);
        let (status, _) =
            call(&h.state, Method::GET, "/queue/read?accountId=stranger&total=1&buy=1&sell=0", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(h.state.ledger.snapshot(PositionSide::Following, "stranger").is_none());
        assert!(h.state.ledger.all_snapshots().is_empty());
    }

    #[tokio::test]
    async fn duplicate_is_soft() {
        let h = harness(&[]);
        call(&h.state, Method::POST, "/queue/add", Some(open_body(7))).await;
        let (status, body) = call(&h.state, Method::POST, "/queue/add", Some(open_body(7))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["duplicate"], true);
        assert_eq!(body["queueSize"], 1);
    }

    #[tokio::test]
    async fn read_with_counts_reconciles() {
        let h = harness(&[]);
        let report = json!({ "accountId": "7412666", "total": 1, "buy": 1, "sell": 0 });
        let (status, _) = call(&h.state, Method::POST, "/positions/report", Some(report)).await;
        assert_eq!(status, StatusCode::OK);

        call(&h.state, Method::GET, "/queue/read?accountId=6098214&total=1&buy=1&sell=0", None).await;
        assert_eq!(h.notifier.count(), 0);

        let (status, body) =
            call(&h.state, Method::GET, "/queue/read?accountId=6098214&total=2&buy=2&sell=0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].is_null());
        assert_eq!(h.notifier.count(), 1);
        let snap = h.state.ledger.snapshot(PositionSide::Following, "6098214").unwrap();
        assert_eq!(snap.counts.total, 2);

        // zero is a valid count, not "absent"
        call(&h.state, Method::GET, "/queue/read?accountId=6098214&total=0&buy=0&sell=0", None).await;
        let snap = h.state.ledger.snapshot(PositionSide::Following, "6098214").unwrap();
        assert_eq!(snap.counts.total, 0);

        let (_, body) = call(&h.state, Method::GET, "/positions", None).await;
        let positions = body["positions"].as_array().unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0]["accountId"], "6098214");
        assert_eq!(positions[0]["side"], "following");
        assert_eq!(positions[1]["snapshot"]["total"], 1);
    }

    #[tokio::test]
    async fn stats_peek_clear_health() {
        let h = harness(&[]);
        call(&h.state, Method::POST, "/queue/add", Some(open_body(1))).await;
        call(&h.state, Method::POST, "/queue/add", Some(open_body(2))).await;

        let (_, body) = call(&h.state, Method::GET, "/queue/stats", None).await;
        assert_eq!(body["stats"]["size"], 2);
        assert_eq!(body["stats"]["queueCount"], 1);
        assert_eq!(body["stats"]["accountQueues"]["7412666"], 2);

        let (_, body) = call(&h.state, Method::GET, "/queue/peek?accountId=7412666", None).await;
        assert_eq!(body["data"]["ticket"], 1);
        assert_eq!(body["queueSize"], 2);

        let (_, body) = call(&h.state, Method::POST, "/queue/clear?accountId=7412666", None).await;
        assert_eq!(body["cleared"], 2);
        let (_, body) = call(&h.state, Method::GET, "/queue/stats?accountId=7412666", None).await;
        assert_eq!(body["stats"]["size"], 0);
        assert!(body["stats"]["oldestMessageTime"].is_null());

        call(&h.state, Method::POST, "/queue/add", Some(open_body(3))).await;
        let (_, body) = call(&h.state, Method::GET, "/queue/depth?accountId=6098214", None).await;
        assert_eq!(body["queueSize"], 1);
        let (status, _) = call(&h.state, Method::GET, "/queue/depth?accountId=nobody", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&h.state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");

        let (status, _) = call(&h.state, Method::GET, "/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
