// 🏪 Merchant Profiles - Learned merchant → category frequencies
// "STARBUCKS *123", "Starbucks Coffee" and "STARBUCKS" all normalize
// to one merchant key; counts only ever increment (except explicit
// reset), so suggestions get steadier as history accumulates.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StateStoreError;

// ============================================================================
// MERCHANT TYPE
// ============================================================================

/// Coarse merchant classification. Split triggers and the keyword
/// table key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MerchantType {
    Restaurant,
    OnlineRetail,
    WarehouseClub,
    GasStation,
    Grocery,
    Subscription,
    Utility,
    Other,
}

impl MerchantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MerchantType::Restaurant => "restaurant",
            MerchantType::OnlineRetail => "online_retail",
            MerchantType::WarehouseClub => "warehouse_club",
            MerchantType::GasStation => "gas_station",
            MerchantType::Grocery => "grocery",
            MerchantType::Subscription => "subscription",
            MerchantType::Utility => "utility",
            MerchantType::Other => "other",
        }
    }

    fn from_str(s: &str) -> MerchantType {
        match s {
            "restaurant" => MerchantType::Restaurant,
            "online_retail" => MerchantType::OnlineRetail,
            "warehouse_club" => MerchantType::WarehouseClub,
            "gas_station" => MerchantType::GasStation,
            "grocery" => MerchantType::Grocery,
            "subscription" => MerchantType::Subscription,
            "utility" => MerchantType::Utility,
            _ => MerchantType::Other,
        }
    }
}

// ============================================================================
// MERCHANT KEY NORMALIZATION
// ============================================================================

/// Normalize a payee / merchant string into a stable lookup key.
///
/// - lowercase
/// - remove pure location codes (*123, #456) but keep words like *TRIP
/// - remove common corporate suffixes (inc, corp, .com)
/// - collapse whitespace
pub fn normalize_merchant_key(s: &str) -> String {
    let lowered = s.to_lowercase();

    let mut normalized = lowered
        .split_whitespace()
        .filter_map(|word| {
            if let Some(rest) = word.strip_prefix('*').or_else(|| word.strip_prefix('#')) {
                if rest.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                return Some(rest.to_string());
            }
            Some(word.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ");

    let suffixes = [
        " inc",
        " corp",
        " llc",
        " ltd",
        " co",
        " corporation",
        " company",
        ".com",
        ".net",
        ".org",
    ];
    for suffix in &suffixes {
        if normalized.ends_with(suffix) {
            normalized = normalized[..normalized.len() - suffix.len()].to_string();
        }
    }

    normalized.trim().to_string()
}

// ============================================================================
// MERCHANT PROFILE
// ============================================================================

/// Learned per-merchant category-frequency statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantProfile {
    pub merchant_key: String,
    pub category_counts: HashMap<String, u32>,
    pub total_observations: u32,
    pub merchant_type: MerchantType,
}

impl MerchantProfile {
    pub fn new(merchant_key: String, merchant_type: MerchantType) -> Self {
        MerchantProfile {
            merchant_key,
            category_counts: HashMap::new(),
            total_observations: 0,
            merchant_type,
        }
    }

    /// Record one categorization of this merchant.
    pub fn observe(&mut self, category_id: &str) {
        *self
            .category_counts
            .entry(category_id.to_string())
            .or_insert(0) += 1;
        self.total_observations += 1;
    }

    /// Profile-based confidence for a category:
    /// `floor(100 * count / total_observations)`.
    pub fn confidence_for(&self, category_id: &str) -> u8 {
        if self.total_observations == 0 {
            return 0;
        }
        let count = self.category_counts.get(category_id).copied().unwrap_or(0);
        ((100 * count as u64) / self.total_observations as u64) as u8
    }

    /// Most frequently observed category, ties broken by category id
    /// for determinism.
    pub fn top_category(&self) -> Option<(&str, u32)> {
        self.category_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(cat, count)| (cat.as_str(), *count))
    }
}

// ============================================================================
// PROFILE STORE INTERFACE
// ============================================================================

/// Injected repository for merchant profiles - no module-level
/// singleton, so tests can swap in a memory-backed double.
pub trait MerchantProfileStore: Send {
    fn get(&self, merchant_key: &str) -> Result<Option<MerchantProfile>, StateStoreError>;

    /// Increment the (merchant, category) count, creating the profile
    /// on first observation. The type hint upgrades `Other` but never
    /// downgrades a learned type.
    fn observe(
        &self,
        merchant_key: &str,
        category_id: &str,
        type_hint: Option<MerchantType>,
    ) -> Result<(), StateStoreError>;

    /// Explicit reset - the only way counts ever go down.
    fn reset(&self, merchant_key: &str) -> Result<(), StateStoreError>;
}

fn apply_observation(
    profile: &mut MerchantProfile,
    category_id: &str,
    type_hint: Option<MerchantType>,
) {
    profile.observe(category_id);
    if let Some(hint) = type_hint {
        if profile.merchant_type == MerchantType::Other {
            profile.merchant_type = hint;
        }
    }
}

// ============================================================================
// SQLITE-BACKED STORE
// ============================================================================

pub struct SqliteProfileStore {
    conn: Mutex<Connection>,
}

impl SqliteProfileStore {
    pub fn open(path: &Path) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening profile store at {}", path.display()))
            .map_err(|e| StateStoreError::Unavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()
            .context("opening in-memory profile store")
            .map_err(|e| StateStoreError::Unavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StateStoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS merchant_profiles (
                merchant_key TEXT PRIMARY KEY,
                merchant_type TEXT NOT NULL,
                total_observations INTEGER NOT NULL,
                category_counts TEXT NOT NULL
            )",
            [],
        )
        .context("creating merchant_profiles table")?;

        Ok(SqliteProfileStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_profile(
        conn: &Connection,
        merchant_key: &str,
    ) -> Result<Option<MerchantProfile>, StateStoreError> {
        let row = conn
            .query_row(
                "SELECT merchant_type, total_observations, category_counts
                 FROM merchant_profiles WHERE merchant_key = ?1",
                params![merchant_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("querying merchant profile")?;

        match row {
            None => Ok(None),
            Some((merchant_type, total, counts_json)) => {
                let category_counts: HashMap<String, u32> = serde_json::from_str(&counts_json)
                    .context("parsing category counts JSON")?;
                Ok(Some(MerchantProfile {
                    merchant_key: merchant_key.to_string(),
                    category_counts,
                    total_observations: total as u32,
                    merchant_type: MerchantType::from_str(&merchant_type),
                }))
            }
        }
    }
}

impl MerchantProfileStore for SqliteProfileStore {
    fn get(&self, merchant_key: &str) -> Result<Option<MerchantProfile>, StateStoreError> {
        let conn = self.lock();
        Self::read_profile(&conn, merchant_key)
    }

    fn observe(
        &self,
        merchant_key: &str,
        category_id: &str,
        type_hint: Option<MerchantType>,
    ) -> Result<(), StateStoreError> {
        let conn = self.lock();
        let mut profile = Self::read_profile(&conn, merchant_key)?.unwrap_or_else(|| {
            MerchantProfile::new(
                merchant_key.to_string(),
                type_hint.unwrap_or(MerchantType::Other),
            )
        });
        apply_observation(&mut profile, category_id, type_hint);

        let counts_json =
            serde_json::to_string(&profile.category_counts).context("encoding category counts")?;
        conn.execute(
            "INSERT INTO merchant_profiles
             (merchant_key, merchant_type, total_observations, category_counts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(merchant_key) DO UPDATE SET
                merchant_type = excluded.merchant_type,
                total_observations = excluded.total_observations,
                category_counts = excluded.category_counts",
            params![
                merchant_key,
                profile.merchant_type.as_str(),
                profile.total_observations as i64,
                counts_json
            ],
        )
        .context("upserting merchant profile")?;
        Ok(())
    }

    fn reset(&self, merchant_key: &str) -> Result<(), StateStoreError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM merchant_profiles WHERE merchant_key = ?1",
            params![merchant_key],
        )
        .context("resetting merchant profile")?;
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY STORE (test double)
// ============================================================================

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<String, MerchantProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MerchantProfileStore for MemoryProfileStore {
    fn get(&self, merchant_key: &str) -> Result<Option<MerchantProfile>, StateStoreError> {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        Ok(profiles.get(merchant_key).cloned())
    }

    fn observe(
        &self,
        merchant_key: &str,
        category_id: &str,
        type_hint: Option<MerchantType>,
    ) -> Result<(), StateStoreError> {
        let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        let profile = profiles.entry(merchant_key.to_string()).or_insert_with(|| {
            MerchantProfile::new(
                merchant_key.to_string(),
                type_hint.unwrap_or(MerchantType::Other),
            )
        });
        apply_observation(profile, category_id, type_hint);
        Ok(())
    }

    fn reset(&self, merchant_key: &str) -> Result<(), StateStoreError> {
        let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        profiles.remove(merchant_key);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_merchant_key() {
        assert_eq!(normalize_merchant_key("STARBUCKS *123"), "starbucks");
        assert_eq!(normalize_merchant_key("Amazon.com Inc"), "amazon");
        assert_eq!(normalize_merchant_key("UBER *TRIP #456"), "uber trip");
        assert_eq!(normalize_merchant_key("Costco Wholesale Corp"), "costco wholesale");
        assert_eq!(
            normalize_merchant_key("Shell Oil"),
            normalize_merchant_key("SHELL OIL")
        );
    }

    #[test]
    fn test_profile_confidence_floors() {
        let mut profile = MerchantProfile::new("starbucks".to_string(), MerchantType::Restaurant);
        profile.observe("Coffee");
        profile.observe("Coffee");
        profile.observe("Dining");

        // 2/3 = 66.67 -> floor 66
        assert_eq!(profile.confidence_for("Coffee"), 66);
        assert_eq!(profile.confidence_for("Dining"), 33);
        assert_eq!(profile.confidence_for("Groceries"), 0);
        assert_eq!(profile.top_category(), Some(("Coffee", 2)));
    }

    fn stores() -> Vec<Box<dyn MerchantProfileStore>> {
        vec![
            Box::new(SqliteProfileStore::open_in_memory().unwrap()),
            Box::new(MemoryProfileStore::new()),
        ]
    }

    #[test]
    fn test_observe_creates_then_increments() {
        for store in stores() {
            store
                .observe("starbucks", "Coffee", Some(MerchantType::Restaurant))
                .unwrap();
            store.observe("starbucks", "Coffee", None).unwrap();
            store.observe("starbucks", "Dining", None).unwrap();

            let profile = store.get("starbucks").unwrap().unwrap();
            assert_eq!(profile.total_observations, 3);
            assert_eq!(profile.category_counts.get("Coffee"), Some(&2));
            assert_eq!(profile.merchant_type, MerchantType::Restaurant);
        }
    }

    #[test]
    fn test_type_hint_never_downgrades() {
        for store in stores() {
            store
                .observe("costco", "Groceries", Some(MerchantType::WarehouseClub))
                .unwrap();
            store
                .observe("costco", "Groceries", Some(MerchantType::Other))
                .unwrap();

            let profile = store.get("costco").unwrap().unwrap();
            assert_eq!(profile.merchant_type, MerchantType::WarehouseClub);
        }
    }

    #[test]
    fn test_reset_clears_counts() {
        for store in stores() {
            store.observe("starbucks", "Coffee", None).unwrap();
            store.reset("starbucks").unwrap();
            assert!(store.get("starbucks").unwrap().is_none());
        }
    }
}
