//! Prometheus-compatible counters for the agent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct Metrics {
    pub packets_rx_total: AtomicU64,
    pub packets_tx_total: AtomicU64,
    pub frames_injected_total: AtomicU64,
    pub hellos_rx_total: AtomicU64,
    pub hellos_tx_total: AtomicU64,
    pub keepalives_tx_total: AtomicU64,
    pub decrypt_failures_total: AtomicU64,
    pub replay_drops_total: AtomicU64,
    pub arp_proxy_hits_total: AtomicU64,
    pub controller_reconnects_total: AtomicU64,
    pub peers_connected: AtomicU64,
    pub mac_table_entries: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Metrics {
            packets_rx_total: AtomicU64::new(0),
            packets_tx_total: AtomicU64::new(0),
            frames_injected_total: AtomicU64::new(0),
            hellos_rx_total: AtomicU64::new(0),
            hellos_tx_total: AtomicU64::new(0),
            keepalives_tx_total: AtomicU64::new(0),
            decrypt_failures_total: AtomicU64::new(0),
            replay_drops_total: AtomicU64::new(0),
            arp_proxy_hits_total: AtomicU64::new(0),
            controller_reconnects_total: AtomicU64::new(0),
            peers_connected: AtomicU64::new(0),
            mac_table_entries: AtomicU64::new(0),
        })
    }

    pub fn inc_packets_rx(&self) {
        self.packets_rx_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_packets_tx(&self) {
        self.packets_tx_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames_injected(&self) {
        self.frames_injected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hellos_rx(&self) {
        self.hellos_rx_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hellos_tx(&self) {
        self.hellos_tx_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_keepalives_tx(&self) {
        self.keepalives_tx_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_decrypt_failures(&self) {
        self.decrypt_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_replay_drops(&self) {
        self.replay_drops_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_arp_proxy_hits(&self) {
        self.arp_proxy_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_controller_reconnects(&self) {
        self.controller_reconnects_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_peers_connected(&self, n: u64) {
        self.peers_connected.store(n, Ordering::Relaxed);
    }

    pub fn set_mac_table_entries(&self, n: u64) {
        self.mac_table_entries.store(n, Ordering::Relaxed);
    }

    /// Formats all metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);
        let counters: &[(&str, &str, &AtomicU64)] = &[
            (
                "zeromesh_packets_rx_total",
                "Total datagrams received",
                &self.packets_rx_total,
            ),
            (
                "zeromesh_packets_tx_total",
                "Total datagrams sent",
                &self.packets_tx_total,
            ),
            (
                "zeromesh_frames_injected_total",
                "Frames injected into the tap",
                &self.frames_injected_total,
            ),
            (
                "zeromesh_hellos_rx_total",
                "Hello handshakes received",
                &self.hellos_rx_total,
            ),
            (
                "zeromesh_hellos_tx_total",
                "Hello handshakes sent",
                &self.hellos_tx_total,
            ),
            (
                "zeromesh_keepalives_tx_total",
                "Keepalives sent",
                &self.keepalives_tx_total,
            ),
            (
                "zeromesh_decrypt_failures_total",
                "Datagrams dropped on decrypt failure",
                &self.decrypt_failures_total,
            ),
            (
                "zeromesh_replay_drops_total",
                "Datagrams dropped by the replay window",
                &self.replay_drops_total,
            ),
            (
                "zeromesh_arp_proxy_hits_total",
                "ARP requests answered from cache",
                &self.arp_proxy_hits_total,
            ),
            (
                "zeromesh_controller_reconnects_total",
                "Control channel reconnect attempts",
                &self.controller_reconnects_total,
            ),
        ];
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        let gauges: &[(&str, &str, &AtomicU64)] = &[
            (
                "zeromesh_peers_connected",
                "Peers currently connected",
                &self.peers_connected,
            ),
            (
                "zeromesh_mac_table_entries",
                "MAC table entries",
                &self.mac_table_entries,
            ),
        ];
        for (name, help, value) in gauges {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out
    }
}
