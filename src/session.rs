use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::tparams::TransportParams;

/// A TLS 1.3 session ticket bound to a server endpoint, with everything a
/// 0-RTT attempt needs: the peer's transport parameters at issuance and the
/// early-data allowance.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub ticket_data: Bytes,
    pub server_name: String,
    pub port: u16,
    pub saved_params: TransportParams,
    pub max_early_data_size: u32,
    /// Ticket-age obfuscation value (RFC 8446 Section 4.6.1).
    pub ticket_age_add: u32,
    pub received_time: SystemTime,
    pub expiry: SystemTime,
}

impl SessionTicket {
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        !self.ticket_data.is_empty() && now < self.expiry
    }

    /// Obfuscated ticket age in milliseconds for the ClientHello.
    pub fn obfuscated_age(&self) -> u32 {
        self.obfuscated_age_at(SystemTime::now())
    }

    pub fn obfuscated_age_at(&self, now: SystemTime) -> u32 {
        let age_ms = now
            .duration_since(self.received_time)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u32;
        age_ms.wrapping_add(self.ticket_age_add)
    }
}

/// Tickets keyed by `"host:port"`. Internally locked: the store is shared
/// between connections on different executors.
#[derive(Debug, Default)]
pub struct SessionTicketStore {
    tickets: Mutex<HashMap<String, SessionTicket>>,
}

impl SessionTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_key(server: &str, port: u16) -> String {
        format!("{server}:{port}")
    }

    pub fn store(&self, ticket: SessionTicket) {
        let key = Self::make_key(&ticket.server_name, ticket.port);
        self.tickets
            .lock()
            .expect("ticket store poisoned")
            .insert(key, ticket);
    }

    /// Expired tickets are treated as absent.
    pub fn retrieve(&self, server: &str, port: u16) -> Option<SessionTicket> {
        let tickets = self.tickets.lock().expect("ticket store poisoned");
        tickets
            .get(&Self::make_key(server, port))
            .filter(|t| t.is_valid())
            .cloned()
    }

    pub fn has_ticket(&self, server: &str, port: u16) -> bool {
        self.retrieve(server, port).is_some()
    }

    pub fn remove(&self, server: &str, port: u16) -> bool {
        self.tickets
            .lock()
            .expect("ticket store poisoned")
            .remove(&Self::make_key(server, port))
            .is_some()
    }

    pub fn cleanup_expired(&self) -> usize {
        let mut tickets = self.tickets.lock().expect("ticket store poisoned");
        let before = tickets.len();
        tickets.retain(|_, t| t.is_valid());
        before - tickets.len()
    }

    pub fn clear(&self) {
        self.tickets.lock().expect("ticket store poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.tickets.lock().expect("ticket store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReplayFilterConfig {
    pub window: Duration,
    pub max_entries: usize,
}

impl Default for ReplayFilterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            max_entries: 100_000,
        }
    }
}

#[derive(Debug)]
struct NonceEntry {
    nonce: Vec<u8>,
    timestamp: SystemTime,
}

/// Bounded, time-windowed set of 0-RTT nonces. A nonce seen twice inside
/// the window is a replay; the oldest entries are evicted when the filter
/// fills.
#[derive(Debug, Default)]
pub struct ReplayFilter {
    config: ReplayFilterConfig,
    entries: Mutex<Vec<NonceEntry>>,
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self::with_config(ReplayFilterConfig::default())
    }

    pub fn with_config(config: ReplayFilterConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Returns true if the nonce is fresh (recorded), false on replay.
    pub fn check_and_record(&self, nonce: &[u8]) -> bool {
        self.check_and_record_at(nonce, SystemTime::now())
    }

    pub fn check_and_record_at(&self, nonce: &[u8], now: SystemTime) -> bool {
        let mut entries = self.entries.lock().expect("replay filter poisoned");

        // expire entries that fell out of the window
        let window = self.config.window;
        entries.retain(|e| {
            now.duration_since(e.timestamp)
                .map_or(true, |age| age <= window)
        });

        if entries.iter().any(|e| e.nonce == nonce) {
            return false;
        }

        if entries.len() >= self.config.max_entries {
            // oldest first
            entries.remove(0);
        }
        entries.push(NonceEntry {
            nonce: nonce.to_vec(),
            timestamp: now,
        });
        true
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(SystemTime::now())
    }

    pub fn cleanup_at(&self, now: SystemTime) -> usize {
        let mut entries = self.entries.lock().expect("replay filter poisoned");
        let before = entries.len();
        let window = self.config.window;
        entries.retain(|e| {
            now.duration_since(e.timestamp)
                .map_or(true, |age| age <= window)
        });
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("replay filter poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("replay filter poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ticket(server: &str, expiry_in: Duration) -> SessionTicket {
        let now = SystemTime::now();
        SessionTicket {
            ticket_data: Bytes::from_static(&[1, 2, 3, 4]),
            server_name: server.to_string(),
            port: 443,
            saved_params: TransportParams::default(),
            max_early_data_size: 0xffff_ffff,
            ticket_age_add: 0x1234_5678,
            received_time: now,
            expiry: now + expiry_in,
        }
    }

    #[test]
    fn test_store_retrieve_remove() {
        let store = SessionTicketStore::new();
        store.store(ticket("example.test", Duration::from_secs(3600)));
        assert!(store.has_ticket("example.test", 443));
        assert!(!store.has_ticket("example.test", 80));
        assert!(!store.has_ticket("other.test", 443));

        let t = store.retrieve("example.test", 443).unwrap();
        assert_eq!(t.ticket_data.as_ref(), &[1, 2, 3, 4]);

        assert!(store.remove("example.test", 443));
        assert!(!store.remove("example.test", 443));
        assert!(store.is_empty());
    }

    #[test]
    fn test_expired_ticket_is_absent() {
        let store = SessionTicketStore::new();
        let mut t = ticket("example.test", Duration::from_secs(3600));
        t.expiry = SystemTime::now() - Duration::from_secs(1);
        store.store(t);
        assert!(store.retrieve("example.test", 443).is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_obfuscated_age() {
        let t = ticket("example.test", Duration::from_secs(3600));
        let later = t.received_time + Duration::from_millis(500);
        assert_eq!(t.obfuscated_age_at(later), 500u32.wrapping_add(0x1234_5678));
    }

    #[test]
    fn test_replay_detection() {
        let filter = ReplayFilter::new();
        assert!(filter.check_and_record(b"nonce-a"));
        assert!(!filter.check_and_record(b"nonce-a"), "replay rejected");
        assert!(filter.check_and_record(b"nonce-b"));
    }

    #[test]
    fn test_window_expiry_readmits() {
        let filter = ReplayFilter::with_config(ReplayFilterConfig {
            window: Duration::from_secs(10),
            max_entries: 100,
        });
        let t0 = SystemTime::now();
        assert!(filter.check_and_record_at(b"nonce", t0));
        assert!(!filter.check_and_record_at(b"nonce", t0 + Duration::from_secs(5)));
        // outside the window the entry has expired
        assert!(filter.check_and_record_at(b"nonce", t0 + Duration::from_secs(11)));
    }

    #[test]
    fn test_bounded_eviction() {
        let filter = ReplayFilter::with_config(ReplayFilterConfig {
            window: Duration::from_secs(3600),
            max_entries: 2,
        });
        let t0 = SystemTime::now();
        filter.check_and_record_at(b"a", t0);
        filter.check_and_record_at(b"b", t0 + Duration::from_secs(1));
        filter.check_and_record_at(b"c", t0 + Duration::from_secs(2));
        assert_eq!(filter.len(), 2);
        // "a" was evicted and is admitted again
        assert!(filter.check_and_record_at(b"a", t0 + Duration::from_secs(3)));
    }
}
