use ulid::Ulid;

use crate::model::*;

use super::WalStore;

impl WalStore {
    pub async fn bookings_with_status(&self, resource_key: &str, status: StatusKind) -> Vec<Booking> {
        let Some(rb) = self.get_resource(resource_key) else {
            return Vec::new();
        };
        let guard = rb.read().await;
        guard.with_status(status).cloned().collect()
    }

    pub async fn find_booking(&self, id: Ulid) -> Option<Booking> {
        let key = self.ticket_index.get(&id).map(|e| e.value().clone())?;
        let rb = self.get_resource(&key)?;
        let guard = rb.read().await;
        guard.get(id).cloned()
    }

    /// Resource keys with at least one booking, sorted.
    pub async fn occupied_keys(&self) -> Vec<String> {
        let entries: Vec<_> = self
            .resources
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut keys = Vec::with_capacity(entries.len());
        for (key, rb) in entries {
            if !rb.read().await.bookings.is_empty() {
                keys.push(key);
            }
        }
        keys.sort();
        keys
    }
}
