use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use loadout_core::builder::{build_loadout, BuildRequest};
use loadout_core::domain::contact::{Contact, ContactId};
use loadout_core::domain::loadout::{LoadoutId, TenantId};

use crate::connection::DbPool;
use crate::repositories::{
    ContactRepository, LoadoutRepository, RepositoryError, SqlContactRepository,
    SqlLoadoutRepository,
};

pub const DEMO_TENANT_ID: &str = "tenant-demo";

/// Loadouts seeded for the demo tenant. The first one is activated.
const SEED_LOADOUTS: &[SeedLoadoutContract] = &[
    SeedLoadoutContract {
        id: "LO-demo-saas",
        preset: "saas",
        name: "Demo SaaS outbound",
        description: "Full autonomous chain with a score-gated qualifier",
    },
    SeedLoadoutContract {
        id: "LO-demo-agency",
        preset: "agency",
        name: "Demo agency hybrid",
        description: "Hybrid chain; a human closes",
    },
];

/// Contacts spanning both sides of the qualification threshold.
const SEED_CONTACTS: &[SeedContactContract] = &[
    SeedContactContract { id: "C-demo-cold", score: 20, tags: &["webinar"] },
    SeedContactContract { id: "C-demo-warm", score: 55, tags: &["trial"] },
    SeedContactContract { id: "C-demo-hot", score: 90, tags: &["trial", "vip"] },
];

/// Deterministic demo data for a local database: two loadouts (one active)
/// and a handful of contacts ready to be enrolled.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub fn tenant() -> TenantId {
        TenantId(DEMO_TENANT_ID.to_string())
    }

    pub fn active_loadout_id() -> LoadoutId {
        LoadoutId(SEED_LOADOUTS[0].id.to_string())
    }

    /// Loads the dataset. Rows that already exist are left untouched, so
    /// loading twice is harmless.
    pub async fn load(pool: &DbPool, now: DateTime<Utc>) -> Result<SeedResult, RepositoryError> {
        let tenant = Self::tenant();
        let loadouts = SqlLoadoutRepository::new(pool.clone());
        let contacts = SqlContactRepository::new(pool.clone());

        let mut loadouts_seeded = Vec::new();
        for contract in SEED_LOADOUTS {
            let id = LoadoutId(contract.id.to_string());
            if loadouts.find_by_id(&tenant, &id).await?.is_none() {
                let request = BuildRequest {
                    description: Some(contract.description.to_string()),
                    ..BuildRequest::from_preset(contract.name, contract.preset)
                };
                let mut loadout = build_loadout(tenant.clone(), request, now).map_err(|error| {
                    RepositoryError::Decode(format!("seed loadout `{}`: {error}", contract.id))
                })?;
                loadout.id = id;
                loadouts.insert(loadout).await?;
            }
            loadouts_seeded.push(contract.id);
        }

        let active_id = Self::active_loadout_id();
        let activation = loadouts.tenant_activation(&tenant).await?;
        if activation.active_loadout_id.is_none() {
            loadouts.swap_active(&tenant, Some(&active_id), activation.version, now).await?;
        }

        let mut contacts_seeded = Vec::new();
        for contract in SEED_CONTACTS {
            let id = ContactId(contract.id.to_string());
            if contacts.find(&tenant, &id).await?.is_none() {
                let mut contact =
                    Contact::new(contract.id, tenant.clone(), Decimal::from(contract.score));
                for tag in contract.tags {
                    contact = contact.with_tag(*tag);
                }
                contact.created_at = now;
                contact.updated_at = now;
                contacts.save(contact).await?;
            }
            contacts_seeded.push(contract.id);
        }

        Ok(SeedResult { tenant_id: DEMO_TENANT_ID, loadouts_seeded, contacts_seeded })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let tenant = Self::tenant();
        let loadouts = SqlLoadoutRepository::new(pool.clone());
        let contacts = SqlContactRepository::new(pool.clone());
        let mut checks = Vec::new();

        for contract in SEED_LOADOUTS {
            let stored = loadouts.find_by_id(&tenant, &LoadoutId(contract.id.to_string())).await?;
            let compiled = stored.is_some_and(|loadout| !loadout.chain.steps.is_empty());
            checks.push((contract.id, compiled));
        }

        let activation = loadouts.tenant_activation(&tenant).await?;
        checks.push((
            "demo-activation",
            activation.active_loadout_id == Some(Self::active_loadout_id()),
        ));
        let active = loadouts.list_active().await?;
        checks.push((
            "demo-single-active",
            active.iter().filter(|loadout| loadout.tenant_id == tenant).count() == 1,
        ));

        for contract in SEED_CONTACTS {
            let stored = contacts.find(&tenant, &ContactId(contract.id.to_string())).await?;
            checks.push((contract.id, stored.is_some()));
        }

        let all_present = checks.iter().all(|(_, passed)| *passed);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes every row belonging to the demo tenant.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        for table in ["contact_activity", "dispatch_ledger", "admission_slot", "contact"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE tenant_id = ?"))
                .bind(DEMO_TENANT_ID)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM tenant_activation WHERE tenant_id = ?")
            .bind(DEMO_TENANT_ID)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM loadout WHERE tenant_id = ?")
            .bind(DEMO_TENANT_ID)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedLoadoutContract {
    id: &'static str,
    preset: &'static str,
    name: &'static str,
    description: &'static str,
}

#[derive(Debug, Clone, Copy)]
struct SeedContactContract {
    id: &'static str,
    score: i64,
    tags: &'static [&'static str],
}

#[derive(Debug)]
pub struct SeedResult {
    pub tenant_id: &'static str,
    pub loadouts_seeded: Vec<&'static str>,
    pub contacts_seeded: Vec<&'static str>,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
