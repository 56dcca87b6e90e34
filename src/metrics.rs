// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

// An idle scraper must not hold the single accept thread.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(2);

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Relay: queue --------
pub static ENQUEUES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("relay_enqueue_total", "enqueue requests by result"),
        &["result"],
    )
    .unwrap()
});

pub static DEQUEUES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("relay_dequeue_total", "dequeue requests by result"),
        &["result"],
    )
    .unwrap()
});

pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("relay_queue_depth", "queued events per originating account"),
        &["account"],
    )
    .unwrap()
});

pub static QUEUE_EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("relay_queue_evictions_total", "events dropped because the queue was full"),
        &["account"],
    )
    .unwrap()
});

// -------- Relay: reconciliation --------
pub static RECONCILE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "relay_reconcile_total",
            "position comparisons by outcome (matched, alerted, suppressed, skipped)",
        ),
        &["follower", "outcome"],
    )
    .unwrap()
});

// -------- Follower --------
pub static POLLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("follower_polls_total", "poll cycles by result"),
        &["result"],
    )
    .unwrap()
});

pub static STALE_DISCARDS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("follower_stale_discards_total", "events discarded as stale").unwrap()
});

pub static TIME_PARSE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "follower_time_parse_failures_total",
        "origin timestamps that could not be parsed",
    )
    .unwrap()
});

pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("follower_trades_total", "dispatched trade actions by result"),
        &["action", "result"],
    )
    .unwrap()
});

// Lag from origin timestamp -> dispatch (milliseconds)
pub static LAT_ORIGIN_DISPATCH: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "latency_origin_to_dispatch_ms",
            "Lag between origin timestamp and dispatch (ms)",
        )
        .buckets(vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 3000.0, 5000.0, 10000.0]),
    )
    .unwrap()
});

pub static FOLLOWER_POSITIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("follower_open_positions", "open positions on the following side"),
        &["side"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_ROLE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_role", "process role (label: role)"), &["role"]).unwrap()
});

pub static CONFIG_MAPPED_FOLLOWERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("config_mapped_followers", "followers with a routing entry").unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; a second init is a no-op
    for m in [
        REGISTRY.register(Box::new(ENQUEUES.clone())),
        REGISTRY.register(Box::new(DEQUEUES.clone())),
        REGISTRY.register(Box::new(QUEUE_DEPTH.clone())),
        REGISTRY.register(Box::new(QUEUE_EVICTIONS.clone())),
        REGISTRY.register(Box::new(RECONCILE.clone())),
        REGISTRY.register(Box::new(POLLS.clone())),
        REGISTRY.register(Box::new(STALE_DISCARDS.clone())),
        REGISTRY.register(Box::new(TIME_PARSE_FAILURES.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(LAT_ORIGIN_DISPATCH.clone())),
        REGISTRY.register(Box::new(FOLLOWER_POSITIONS.clone())),
        REGISTRY.register(Box::new(CONFIG_ROLE.clone())),
        REGISTRY.register(Box::new(CONFIG_MAPPED_FOLLOWERS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    if let Err(e) = stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT)) {
        debug!(?e, "metrics read timeout not set");
    }
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Follower metrics endpoint in a dedicated OS thread (the relay serves
// /metrics from its own HTTP router instead)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        info!(%addr, "metrics listening (/ and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn silent_client_still_gets_an_answer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle_client(stream);
        });

        // connect and never send a request line
        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let started = Instant::now();
        let mut rsp = String::new();
        client.read_to_string(&mut rsp).unwrap();

        assert!(rsp.starts_with("HTTP/1.1 200 OK"));
        assert!(started.elapsed() < Duration::from_secs(10));
        server.join().unwrap();
    }
}
