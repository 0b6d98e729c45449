//! Sync counters, registered on a caller-owned registry.
//!
//! - `etd_downloader_{headers,bodies,receipts,states}_in` - items handed to the downloader
//! - `etd_downloader_{headers,bodies,receipts,states}_drop` - items the downloader refused
//! - `etd_downloader_throttle` - deliveries refused because the downloader was busy
//! - `etd_handler_peer_drops` - peers disconnected for a protocol violation
//! - `etd_handler_checkpoint_verified` - checkpoint probes answered correctly
//! - `etd_handler_sync_drops_fired` - peers dropped for not answering a probe
//! - `etd_fetcher_rejected` - announcements and deliveries refused by a full fetcher queue

use prometheus::{IntCounter, Registry};

#[derive(Clone)]
pub struct DeliveryCounters {
    pub delivered: IntCounter,
    pub dropped: IntCounter,
}

impl DeliveryCounters {
    fn new(registry: &Registry, kind: &str) -> Result<Self, prometheus::Error> {
        let delivered = IntCounter::new(
            format!("etd_downloader_{}_in", kind),
            format!("Delivered {} handed to the downloader", kind),
        )?;
        let dropped = IntCounter::new(
            format!("etd_downloader_{}_drop", kind),
            format!("Delivered {} the downloader refused", kind),
        )?;
        registry.register(Box::new(delivered.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        Ok(Self { delivered, dropped })
    }

    pub fn record(&self, items: usize, accepted: bool) {
        let counter = if accepted {
            &self.delivered
        } else {
            &self.dropped
        };
        counter.inc_by(items as u64);
    }
}

#[derive(Clone)]
pub struct SyncMetrics {
    pub headers: DeliveryCounters,
    pub bodies: DeliveryCounters,
    pub receipts: DeliveryCounters,
    pub states: DeliveryCounters,
    pub throttle: IntCounter,
    pub peer_drops: IntCounter,
    pub checkpoint_verified: IntCounter,
    pub sync_drops_fired: IntCounter,
    pub fetcher_rejected: IntCounter,
}

impl SyncMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            headers: DeliveryCounters::new(registry, "headers")?,
            bodies: DeliveryCounters::new(registry, "bodies")?,
            receipts: DeliveryCounters::new(registry, "receipts")?,
            states: DeliveryCounters::new(registry, "states")?,
            throttle: counter("etd_downloader_throttle", "Deliveries refused by a busy downloader")?,
            peer_drops: counter("etd_handler_peer_drops", "Peers dropped for protocol violations")?,
            checkpoint_verified: counter(
                "etd_handler_checkpoint_verified",
                "Checkpoint probes answered with the expected header",
            )?,
            sync_drops_fired: counter(
                "etd_handler_sync_drops_fired",
                "Peers dropped for not answering the checkpoint probe",
            )?,
            fetcher_rejected: counter("etd_fetcher_rejected", "Items refused by a full fetcher queue")?,
        })
    }
}
