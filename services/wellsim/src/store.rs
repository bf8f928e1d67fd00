//! Device and card persistence
//!
//! The session only ever writes its own device row, so updates are plain
//! last-write-wins statements keyed by id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use common::SqliteClient;
use tracing::debug;

use crate::error::{Result, WellSimError};
use crate::model::{Card, Device};

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Devices to simulate; an empty `ids` slice selects every device
    async fn list_devices(&self, ids: &[i64]) -> Result<Vec<Device>>;

    async fn get_device(&self, id: i64) -> Result<Option<Device>>;

    async fn card_by_area_code(&self, area_code: u64) -> Result<Option<Card>>;

    async fn update_registration(
        &self,
        id: i64,
        register_number: &str,
        registered: bool,
    ) -> Result<()>;

    async fn update_uploaded(&self, id: i64, water: u64, electric: u64) -> Result<()>;
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY,
        sn TEXT NOT NULL UNIQUE,
        number INTEGER NOT NULL,
        area_code INTEGER NOT NULL,
        town TEXT NOT NULL DEFAULT '',
        village TEXT NOT NULL DEFAULT '',
        longitude REAL NOT NULL,
        latitude REAL NOT NULL,
        register_number TEXT NOT NULL DEFAULT '',
        registered INTEGER NOT NULL DEFAULT 0,
        uploaded_water INTEGER NOT NULL DEFAULT 0,
        uploaded_electric INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS cards (
        id INTEGER PRIMARY KEY,
        area_code INTEGER NOT NULL,
        card_number TEXT NOT NULL DEFAULT '',
        name TEXT NOT NULL DEFAULT '',
        card_register_number TEXT NOT NULL,
        balance INTEGER NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_cards_area_code ON cards(area_code)",
];

const DEVICE_COLUMNS: &str = "id, sn, number, area_code, town, village, longitude, latitude, \
     register_number, registered, uploaded_water, uploaded_electric";

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: i64,
    sn: String,
    number: i64,
    area_code: i64,
    town: String,
    village: String,
    longitude: f64,
    latitude: f64,
    register_number: String,
    registered: bool,
    uploaded_water: i64,
    uploaded_electric: i64,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            id: row.id,
            sn: row.sn,
            number: row.number as u32,
            area_code: row.area_code as u64,
            town: row.town,
            village: row.village,
            longitude: row.longitude,
            latitude: row.latitude,
            register_number: row.register_number,
            registered: row.registered,
            uploaded_water: row.uploaded_water as u64,
            uploaded_electric: row.uploaded_electric as u64,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CardRow {
    id: i64,
    area_code: i64,
    card_number: String,
    name: String,
    card_register_number: String,
    balance: i64,
}

impl From<CardRow> for Card {
    fn from(row: CardRow) -> Self {
        Card {
            id: row.id,
            area_code: row.area_code as u64,
            card_number: row.card_number,
            name: row.name,
            card_register_number: row.card_register_number,
            balance: row.balance,
        }
    }
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    client: SqliteClient,
}

impl SqliteStore {
    /// Open the database file and create the tables if missing
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let client = SqliteClient::new(path)
            .await
            .map_err(|e| WellSimError::storage(e.to_string()))?;
        Self::with_client(client).await
    }

    pub async fn with_client(client: SqliteClient) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(client.pool()).await?;
        }
        Ok(Self { client })
    }

    /// Insert or replace a device row
    pub async fn upsert_device(&self, device: &Device) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO devices ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            DEVICE_COLUMNS
        ))
        .bind(device.id)
        .bind(&device.sn)
        .bind(i64::from(device.number))
        .bind(device.area_code as i64)
        .bind(&device.town)
        .bind(&device.village)
        .bind(device.longitude)
        .bind(device.latitude)
        .bind(&device.register_number)
        .bind(device.registered)
        .bind(device.uploaded_water as i64)
        .bind(device.uploaded_electric as i64)
        .execute(self.client.pool())
        .await?;
        Ok(())
    }

    /// Insert or replace a card row
    pub async fn upsert_card(&self, card: &Card) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO cards (id, area_code, card_number, name, card_register_number, balance) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(card.id)
        .bind(card.area_code as i64)
        .bind(&card.card_number)
        .bind(&card.name)
        .bind(&card.card_register_number)
        .bind(card.balance)
        .execute(self.client.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn list_devices(&self, ids: &[i64]) -> Result<Vec<Device>> {
        let rows: Vec<DeviceRow> = if ids.is_empty() {
            sqlx::query_as(&format!("SELECT {} FROM devices ORDER BY id", DEVICE_COLUMNS))
                .fetch_all(self.client.pool())
                .await?
        } else {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM devices WHERE id IN ({}) ORDER BY id",
                DEVICE_COLUMNS, placeholders
            );
            let mut query = sqlx::query_as::<_, DeviceRow>(&sql);
            for id in ids {
                query = query.bind(*id);
            }
            query.fetch_all(self.client.pool()).await?
        };
        Ok(rows.into_iter().map(Device::from).collect())
    }

    async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        let row: Option<DeviceRow> =
            sqlx::query_as(&format!("SELECT {} FROM devices WHERE id = ?", DEVICE_COLUMNS))
                .bind(id)
                .fetch_optional(self.client.pool())
                .await?;
        Ok(row.map(Device::from))
    }

    async fn card_by_area_code(&self, area_code: u64) -> Result<Option<Card>> {
        let row: Option<CardRow> = sqlx::query_as(
            "SELECT id, area_code, card_number, name, card_register_number, balance \
             FROM cards WHERE area_code = ? ORDER BY id LIMIT 1",
        )
        .bind(area_code as i64)
        .fetch_optional(self.client.pool())
        .await?;
        Ok(row.map(Card::from))
    }

    async fn update_registration(
        &self,
        id: i64,
        register_number: &str,
        registered: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE devices SET register_number = ?, registered = ? WHERE id = ?")
            .bind(register_number)
            .bind(registered)
            .bind(id)
            .execute(self.client.pool())
            .await?;
        debug!(device_id = id, registered, "registration persisted");
        Ok(())
    }

    async fn update_uploaded(&self, id: i64, water: u64, electric: u64) -> Result<()> {
        sqlx::query("UPDATE devices SET uploaded_water = ?, uploaded_electric = ? WHERE id = ?")
            .bind(water as i64)
            .bind(electric as i64)
            .bind(id)
            .execute(self.client.pool())
            .await?;
        debug!(device_id = id, water, electric, "uploaded totals persisted");
        Ok(())
    }
}

/// In-process store for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    devices: Mutex<HashMap<i64, Device>>,
    cards: Mutex<Vec<Card>>,
}

impl MemoryStore {
    pub fn new(devices: Vec<Device>, cards: Vec<Card>) -> Self {
        Self {
            devices: Mutex::new(devices.into_iter().map(|d| (d.id, d)).collect()),
            cards: Mutex::new(cards),
        }
    }

    /// Insert or replace the card with the same id
    pub fn upsert_card(&self, card: Card) -> Result<()> {
        let mut cards = self
            .cards
            .lock()
            .map_err(|_| WellSimError::storage("card table lock poisoned"))?;
        match cards.iter_mut().find(|c| c.id == card.id) {
            Some(existing) => *existing = card,
            None => cards.push(card),
        }
        Ok(())
    }

    fn with_device<T>(&self, id: i64, f: impl FnOnce(&mut Device) -> T) -> Result<T> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| WellSimError::storage("device table lock poisoned"))?;
        let device = devices
            .get_mut(&id)
            .ok_or_else(|| WellSimError::storage(format!("device {} not found", id)))?;
        Ok(f(device))
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn list_devices(&self, ids: &[i64]) -> Result<Vec<Device>> {
        let devices = self
            .devices
            .lock()
            .map_err(|_| WellSimError::storage("device table lock poisoned"))?;
        let mut out: Vec<Device> = devices
            .values()
            .filter(|d| ids.is_empty() || ids.contains(&d.id))
            .cloned()
            .collect();
        out.sort_by_key(|d| d.id);
        Ok(out)
    }

    async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        let devices = self
            .devices
            .lock()
            .map_err(|_| WellSimError::storage("device table lock poisoned"))?;
        Ok(devices.get(&id).cloned())
    }

    async fn card_by_area_code(&self, area_code: u64) -> Result<Option<Card>> {
        let cards = self
            .cards
            .lock()
            .map_err(|_| WellSimError::storage("card table lock poisoned"))?;
        Ok(cards.iter().find(|c| c.area_code == area_code).cloned())
    }

    async fn update_registration(
        &self,
        id: i64,
        register_number: &str,
        registered: bool,
    ) -> Result<()> {
        self.with_device(id, |d| {
            d.register_number = register_number.to_string();
            d.registered = registered;
        })
    }

    async fn update_uploaded(&self, id: i64, water: u64, electric: u64) -> Result<()> {
        self.with_device(id, |d| {
            d.uploaded_water = water;
            d.uploaded_electric = electric;
        })
    }
}
