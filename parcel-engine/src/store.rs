//! Versioned item store
//!
//! Items are kept individually, keyed by `(booking_id, item_id)`, each with a
//! version that is bumped on every write. A commit names the version it read
//! for every item it writes; any mismatch fails the whole commit.
//!
//! # Locking
//!
//! A commit holds the booking's entry in `bookings` for writing while it
//! checks and applies its item writes. [`BookingStore::view`] holds the same
//! entry for reading while it collects the items, so a view never shows half
//! of a multi-item commit. The lock order is always `bookings` then `items`.
//!
//! # Persistence
//!
//! A store opened over a persistent [`Storage`] writes the whole booking
//! record (header plus every versioned item) before a change is applied in
//! memory, and rebuilds itself from those records on open.

use crate::types::{BookingView, CustomerId, ParcelBooking, ParcelItem};
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ledger_core::Storage;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Store key of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    /// Booking
    pub booking_id: Uuid,
    /// Item
    pub item_id: Uuid,
}

impl ItemKey {
    /// Create new key
    pub fn new(booking_id: Uuid, item_id: Uuid) -> Self {
        Self {
            booking_id,
            item_id,
        }
    }
}

/// Item with its store version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedItem {
    /// Item
    pub item: ParcelItem,
    /// Version; starts at 1
    pub version: u64,
}

/// One item write within a commit
#[derive(Debug, Clone)]
pub struct ItemWrite {
    /// New item state
    pub item: ParcelItem,
    /// Version the new state was derived from
    pub expected_version: u64,
}

impl From<VersionedItem> for ItemWrite {
    fn from(current: VersionedItem) -> Self {
        Self {
            item: current.item,
            expected_version: current.version,
        }
    }
}

/// Stored form of one booking
#[derive(Debug, Serialize, Deserialize)]
struct BookingRecord {
    booking: ParcelBooking,
    items: Vec<VersionedItem>,
}

/// Booking and item store
#[derive(Debug, Default)]
pub struct BookingStore {
    bookings: DashMap<Uuid, ParcelBooking>,
    items: DashMap<ItemKey, VersionedItem>,
    tracking_codes: DashMap<String, ItemKey>,
    by_customer: DashMap<CustomerId, Vec<Uuid>>,
    storage: Option<Arc<Storage>>,
}

impl BookingStore {
    /// Create empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store that persists through `storage`, loading stored bookings
    pub fn open(storage: Arc<Storage>) -> Result<Self> {
        let mut records: Vec<BookingRecord> = storage
            .bookings()?
            .iter()
            .map(|bytes| serde_json::from_slice::<BookingRecord>(bytes))
            .collect::<std::result::Result<_, _>>()?;
        records.sort_by_key(|r| (r.booking.created_at, r.booking.booking_id));

        let store = Self {
            storage: Some(storage),
            ..Self::default()
        };

        for record in records {
            let booking_id = record.booking.booking_id;
            for versioned in record.items {
                let key = ItemKey::new(booking_id, versioned.item.item_id);
                store
                    .tracking_codes
                    .insert(versioned.item.tracking_code.clone(), key);
                store.items.insert(key, versioned);
            }
            store
                .by_customer
                .entry(record.booking.customer_id.clone())
                .or_default()
                .push(booking_id);
            store.bookings.insert(booking_id, record.booking);
        }

        tracing::info!(bookings = store.bookings.len(), "Booking store loaded");
        Ok(store)
    }

    fn persist(&self, booking: &ParcelBooking, items: Vec<VersionedItem>) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let record = BookingRecord {
            booking: booking.clone(),
            items,
        };
        storage.put_booking(booking.booking_id, &serde_json::to_vec(&record)?)?;
        Ok(())
    }

    /// Insert a new booking with its items
    pub fn insert(&self, booking: ParcelBooking, items: Vec<ParcelItem>) -> Result<BookingView> {
        let booking_id = booking.booking_id;
        if self.bookings.contains_key(&booking_id) {
            return Err(Error::Validation(format!(
                "Booking {} already exists",
                booking_id
            )));
        }

        for item in &items {
            if item.booking_id != booking_id {
                return Err(Error::Validation(format!(
                    "Item {} does not belong to booking {}",
                    item.item_id, booking_id
                )));
            }
            item.validate()?;
        }

        self.reserve_tracking_codes(&items)?;

        let stored: Vec<VersionedItem> = items
            .iter()
            .map(|item| VersionedItem {
                item: item.clone(),
                version: 1,
            })
            .collect();
        if let Err(e) = self.persist(&booking, stored) {
            for item in &items {
                self.tracking_codes.remove(&item.tracking_code);
            }
            return Err(e);
        }

        for item in &items {
            self.items.insert(
                ItemKey::new(booking_id, item.item_id),
                VersionedItem {
                    item: item.clone(),
                    version: 1,
                },
            );
        }
        self.by_customer
            .entry(booking.customer_id.clone())
            .or_default()
            .push(booking_id);
        self.bookings.insert(booking_id, booking.clone());

        Ok(BookingView::new(booking, items))
    }

    /// Claim every tracking code or none of them
    fn reserve_tracking_codes(&self, items: &[ParcelItem]) -> Result<()> {
        let mut claimed: Vec<&str> = Vec::with_capacity(items.len());

        for item in items {
            // The entry guard must be released before rolling back
            let taken = match self.tracking_codes.entry(item.tracking_code.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(ItemKey::new(item.booking_id, item.item_id));
                    false
                }
                Entry::Occupied(_) => true,
            };

            if taken {
                for code in claimed {
                    self.tracking_codes.remove(code);
                }
                return Err(Error::DuplicateTrackingCode(item.tracking_code.clone()));
            }
            claimed.push(&item.tracking_code);
        }

        Ok(())
    }

    /// Apply item writes for one booking as a unit
    ///
    /// Every write is checked (ownership, field invariants, version) before
    /// any is applied; on error nothing changes.
    pub fn commit(&self, booking_id: Uuid, writes: Vec<ItemWrite>) -> Result<Vec<VersionedItem>> {
        let booking = self
            .bookings
            .get_mut(&booking_id)
            .ok_or(Error::BookingNotFound(booking_id))?;

        let mut seen = HashSet::with_capacity(writes.len());
        for write in &writes {
            let item_id = write.item.item_id;
            if write.item.booking_id != booking_id {
                return Err(Error::Validation(format!(
                    "Item {} does not belong to booking {}",
                    item_id, booking_id
                )));
            }
            if !seen.insert(item_id) {
                return Err(Error::Validation(format!(
                    "Item {} written twice in one commit",
                    item_id
                )));
            }
            write.item.validate()?;

            let current = self
                .items
                .get(&ItemKey::new(booking_id, item_id))
                .ok_or(Error::ItemNotFound(item_id))?;
            if current.version != write.expected_version {
                return Err(Error::VersionConflict {
                    item_id,
                    expected: write.expected_version,
                    found: current.version,
                });
            }
            if current.item.tracking_code != write.item.tracking_code {
                return Err(Error::Validation(format!(
                    "Tracking code of item {} is immutable",
                    item_id
                )));
            }
        }

        let committed: Vec<VersionedItem> = writes
            .into_iter()
            .map(|write| VersionedItem {
                item: write.item,
                version: write.expected_version + 1,
            })
            .collect();

        if self.storage.is_some() {
            let written: HashMap<Uuid, &VersionedItem> = committed
                .iter()
                .map(|v| (v.item.item_id, v))
                .collect();
            let record_items = self
                .collect_items(&booking)
                .into_iter()
                .map(|current| match written.get(&current.item.item_id) {
                    Some(&next) => next.clone(),
                    None => current,
                })
                .collect();
            self.persist(&booking, record_items)?;
        }

        for stored in &committed {
            self.items.insert(
                ItemKey::new(booking_id, stored.item.item_id),
                stored.clone(),
            );
        }

        tracing::debug!(
            booking_id = %booking_id,
            items = committed.len(),
            "Booking items committed"
        );

        Ok(committed)
    }

    /// Booking header
    pub fn booking(&self, booking_id: Uuid) -> Result<ParcelBooking> {
        self.bookings
            .get(&booking_id)
            .map(|b| b.clone())
            .ok_or(Error::BookingNotFound(booking_id))
    }

    /// One item with its version
    pub fn item(&self, booking_id: Uuid, item_id: Uuid) -> Result<VersionedItem> {
        self.items
            .get(&ItemKey::new(booking_id, item_id))
            .map(|i| i.clone())
            .ok_or(Error::ItemNotFound(item_id))
    }

    /// Every item of a booking with its version, in booking order
    pub fn items(&self, booking_id: Uuid) -> Result<Vec<VersionedItem>> {
        let booking = self
            .bookings
            .get(&booking_id)
            .ok_or(Error::BookingNotFound(booking_id))?;
        Ok(self.collect_items(&booking))
    }

    /// Consistent snapshot of a booking
    pub fn view(&self, booking_id: Uuid) -> Result<BookingView> {
        let booking = self
            .bookings
            .get(&booking_id)
            .ok_or(Error::BookingNotFound(booking_id))?;
        let items = self
            .collect_items(&booking)
            .into_iter()
            .map(|v| v.item)
            .collect();
        Ok(BookingView::new(booking.clone(), items))
    }

    fn collect_items(&self, booking: &ParcelBooking) -> Vec<VersionedItem> {
        booking
            .item_ids
            .iter()
            .filter_map(|item_id| {
                self.items
                    .get(&ItemKey::new(booking.booking_id, *item_id))
                    .map(|i| i.clone())
            })
            .collect()
    }

    /// Look an item up by tracking code
    pub fn find_by_tracking_code(&self, tracking_code: &str) -> Option<VersionedItem> {
        let key = *self.tracking_codes.get(tracking_code)?;
        self.items.get(&key).map(|i| i.clone())
    }

    /// Snapshots of every booking of a customer, in booking order
    pub fn bookings_for_customer(&self, customer_id: &CustomerId) -> Vec<BookingView> {
        let booking_ids = self
            .by_customer
            .get(customer_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        booking_ids
            .into_iter()
            .filter_map(|booking_id| self.view(booking_id).ok())
            .collect()
    }

    /// Customers with at least one booking
    pub fn customers(&self) -> Vec<CustomerId> {
        self.by_customer.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of bookings
    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemStatus, Receiver, SettlementFlag};
    use chrono::{NaiveDate, Utc};
    use ledger_core::{Currency, Money};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn booking_with_items(codes: &[&str]) -> (ParcelBooking, Vec<ParcelItem>) {
        let booking_id = Uuid::now_v7();
        let items: Vec<ParcelItem> = codes
            .iter()
            .map(|code| ParcelItem {
                item_id: Uuid::now_v7(),
                booking_id,
                tracking_code: code.to_string(),
                receiver: Receiver::default(),
                cod: Money::new(dec!(10), Currency::USD),
                delivery_fee: Some(Money::new(dec!(2), Currency::USD)),
                weight_kg: dec!(1),
                status: ItemStatus::Pending,
                collector: None,
                deliverer: None,
                driver_settlement: SettlementFlag::Unsettled,
                customer_settlement: SettlementFlag::Unsettled,
                picked_up_at: None,
                delivered_at: None,
            })
            .collect();

        let booking = ParcelBooking {
            booking_id,
            customer_id: CustomerId::new("cust-1"),
            sender_name: "Sender".to_string(),
            pickup_address: "Street 271".to_string(),
            booking_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            service_id: "standard".to_string(),
            item_ids: items.iter().map(|i| i.item_id).collect(),
            total_delivery_fee: None,
            created_at: Utc::now(),
        };
        (booking, items)
    }

    #[test]
    fn test_insert_and_lookup() {
        let store = BookingStore::new();
        let (booking, items) = booking_with_items(&["A1", "A2"]);
        let booking_id = booking.booking_id;
        store.insert(booking, items.clone()).unwrap();

        let view = store.view(booking_id).unwrap();
        assert_eq!(view.items.len(), 2);
        assert_eq!(view.items[0].tracking_code, "A1");

        let found = store.find_by_tracking_code("A2").unwrap();
        assert_eq!(found.item.item_id, items[1].item_id);
        assert_eq!(found.version, 1);

        assert_eq!(store.bookings_for_customer(&CustomerId::new("cust-1")).len(), 1);
        assert!(store.bookings_for_customer(&CustomerId::new("cust-2")).is_empty());
    }

    #[test]
    fn test_duplicate_tracking_code_claims_nothing() {
        let store = BookingStore::new();
        let (booking, items) = booking_with_items(&["A1"]);
        store.insert(booking, items).unwrap();

        let (booking, items) = booking_with_items(&["B1", "A1"]);
        let err = store.insert(booking, items).unwrap_err();
        assert!(matches!(err, Error::DuplicateTrackingCode(code) if code == "A1"));

        // B1 was released again
        let (booking, items) = booking_with_items(&["B1"]);
        assert!(store.insert(booking, items).is_ok());
        assert_eq!(store.booking_count(), 2);
    }

    #[test]
    fn test_commit_bumps_version() {
        let store = BookingStore::new();
        let (booking, items) = booking_with_items(&["A1"]);
        let booking_id = booking.booking_id;
        store.insert(booking, items.clone()).unwrap();

        let mut current = store.item(booking_id, items[0].item_id).unwrap();
        current.item.weight_kg = dec!(2.5);
        let committed = store.commit(booking_id, vec![current.into()]).unwrap();
        assert_eq!(committed[0].version, 2);
        assert_eq!(
            store.item(booking_id, items[0].item_id).unwrap().item.weight_kg,
            dec!(2.5)
        );
    }

    #[test]
    fn test_stale_write_rejected_and_nothing_applied() {
        let store = BookingStore::new();
        let (booking, items) = booking_with_items(&["A1", "A2"]);
        let booking_id = booking.booking_id;
        store.insert(booking, items.clone()).unwrap();

        let stale = store.items(booking_id).unwrap();

        let mut fresh = store.item(booking_id, items[1].item_id).unwrap();
        fresh.item.weight_kg = dec!(3);
        store.commit(booking_id, vec![fresh.into()]).unwrap();

        let writes: Vec<ItemWrite> = stale
            .into_iter()
            .map(|mut v| {
                v.item.status = ItemStatus::PickedUp;
                v.into()
            })
            .collect();
        let err = store.commit(booking_id, writes).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict { expected: 1, found: 2, .. }
        ));

        // The first item was checked fine but must not have been applied
        let first = store.item(booking_id, items[0].item_id).unwrap();
        assert_eq!(first.item.status, ItemStatus::Pending);
        assert_eq!(first.version, 1);
    }

    #[test]
    fn test_invalid_write_rejected() {
        let store = BookingStore::new();
        let (booking, items) = booking_with_items(&["A1"]);
        let booking_id = booking.booking_id;
        store.insert(booking, items.clone()).unwrap();

        let mut current = store.item(booking_id, items[0].item_id).unwrap();
        current.item.cod = Money::new(dec!(-5), Currency::USD);
        assert!(matches!(
            store.commit(booking_id, vec![current.into()]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.commit(Uuid::now_v7(), vec![]),
            Err(Error::BookingNotFound(_))
        ));
    }

    #[test]
    fn test_reopen_restores_bookings() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = ledger_core::Config {
            data_dir: Some(temp_dir.path().to_path_buf()),
            sync_writes: false,
            ..Default::default()
        };

        let (booking, items) = booking_with_items(&["A1", "A2"]);
        let booking_id = booking.booking_id;
        {
            let store = BookingStore::open(Arc::new(Storage::open(&config).unwrap())).unwrap();
            store.insert(booking, items.clone()).unwrap();

            let mut current = store.item(booking_id, items[1].item_id).unwrap();
            current.item.customer_settlement = SettlementFlag::Settled;
            store.commit(booking_id, vec![current.into()]).unwrap();
        }

        let reopened = BookingStore::open(Arc::new(Storage::open(&config).unwrap())).unwrap();
        assert_eq!(reopened.booking_count(), 1);
        assert_eq!(reopened.bookings_for_customer(&CustomerId::new("cust-1")).len(), 1);

        let untouched = reopened.item(booking_id, items[0].item_id).unwrap();
        assert_eq!(untouched.version, 1);
        let settled = reopened.find_by_tracking_code("A2").unwrap();
        assert_eq!(settled.version, 2);
        assert_eq!(settled.item.customer_settlement, SettlementFlag::Settled);

        // Tracking codes stay claimed after a restart
        let (booking, items) = booking_with_items(&["A1"]);
        assert!(matches!(
            reopened.insert(booking, items),
            Err(Error::DuplicateTrackingCode(_))
        ));
    }

    #[test]
    fn test_view_never_sees_half_commit() {
        let store = Arc::new(BookingStore::new());
        let (booking, items) = booking_with_items(&["A1", "A2", "A3"]);
        let booking_id = booking.booking_id;
        store.insert(booking, items).unwrap();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for round in 1..=200u32 {
                    let writes: Vec<ItemWrite> = store
                        .items(booking_id)
                        .unwrap()
                        .into_iter()
                        .map(|mut v| {
                            v.item.weight_kg = Decimal::from(round);
                            v.into()
                        })
                        .collect();
                    store.commit(booking_id, writes).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let view = store.view(booking_id).unwrap();
            let first = view.items[0].weight_kg;
            assert!(view.items.iter().all(|i| i.weight_kg == first));
        }

        writer.join().unwrap();
    }
}
