use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SIGNALS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("signals_published_total", "Signals appended to the relay"),
        &["msg_type"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SESSIONS_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sessions_created_total", "Sessions created").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CLAIMS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("device_claims_total", "Device claim attempts by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SESSIONS_EXPIRED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sessions_expired_total", "Sessions expired by the sweeper").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SIGNALS_PRUNED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("signals_pruned_total", "Signals deleted past retention").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DEVICES_MARKED_OFFLINE: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "devices_marked_offline_total",
        "Devices marked offline after missed heartbeats",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ACTIVE_FEEDS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("signal_feeds_active", "Open push-feed websockets").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
