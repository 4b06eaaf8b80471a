//! # Catalogue
//!
//! Read-only view of campaigns, items, privileges and issuer block lists.
//! The engine never writes the catalogue; issuer tooling owns it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::config::CatalogConfig;
use crate::error::{EngineError, EngineResult};
use crate::rarity::EmissionTable;
use crate::types::{Campaign, CampaignId, IssuerId, Item, ItemId, Privilege, PrivilegeId, UserId};

/// Catalogue reads used by the engine.
pub trait Catalog: Send + Sync {
    /// Campaign by id.
    fn campaign(&self, campaign_id: CampaignId) -> Option<Campaign>;

    /// Every item of a campaign, sorted by id.
    fn items_in_campaign(&self, campaign_id: CampaignId) -> Vec<Item>;

    /// Privilege by id.
    fn privilege(&self, privilege_id: PrivilegeId) -> Option<Privilege>;

    /// Whether `issuer_id` has blocked `user_id`.
    fn is_blocked(&self, issuer_id: IssuerId, user_id: UserId) -> bool;
}

/// In-memory catalogue.
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    campaigns: HashMap<CampaignId, Campaign>,
    items: BTreeMap<ItemId, Item>,
    privileges: HashMap<PrivilegeId, Privilege>,
    blocked: HashSet<(IssuerId, UserId)>,
}

impl StaticCatalog {
    /// Creates an empty catalogue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and validates a catalogue from parsed configuration.
    ///
    /// # Errors
    ///
    /// - `InvalidEmissionTable` for a malformed emission table
    /// - `InvalidConfig` for duplicate ids or an empty campaign window
    /// - `CampaignNotFound` / `ItemNotFound` for dangling references
    pub fn from_config(config: &CatalogConfig) -> EngineResult<Self> {
        let mut catalog = Self::new();

        for entry in &config.campaigns {
            let emission_table = EmissionTable::from_toml(&entry.emission_rates).map_err(|e| {
                tracing::error!("campaign {}: {}", entry.id, e);
                e
            })?;
            catalog.add_campaign(Campaign {
                id: entry.id,
                issuer_id: entry.issuer_id,
                starts_at: entry.starts_at,
                ends_at: entry.ends_at,
                emission_table,
            })?;
        }
        for item in &config.items {
            catalog.add_item(item.clone())?;
        }
        for privilege in &config.privileges {
            catalog.add_privilege(privilege.clone())?;
        }
        for list in &config.block_lists {
            for &user_id in &list.users {
                catalog.block_user(list.issuer_id, user_id);
            }
        }

        for campaign in catalog.campaigns.values() {
            for weight in campaign.emission_table.entries() {
                let stocked = catalog
                    .items
                    .values()
                    .any(|i| i.campaign_id == campaign.id && i.rarity == weight.tier);
                if weight.weight > 0.0 && !stocked {
                    tracing::warn!(
                        "campaign {} has weight on tier {} but no items of that tier",
                        campaign.id,
                        weight.tier
                    );
                }
            }
        }

        tracing::info!(
            "catalogue loaded: {} campaigns, {} items, {} privileges",
            catalog.campaigns.len(),
            catalog.items.len(),
            catalog.privileges.len()
        );
        Ok(catalog)
    }

    /// Loads, parses and validates a catalogue file.
    ///
    /// # Errors
    ///
    /// Any error from [`CatalogConfig::load`] or [`Self::from_config`].
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::from_config(&CatalogConfig::load(path)?)
    }

    /// Parses and validates catalogue TOML.
    ///
    /// # Errors
    ///
    /// Any error from [`CatalogConfig::from_toml_str`] or [`Self::from_config`].
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        Self::from_config(&CatalogConfig::from_toml_str(text)?)
    }

    /// Adds a campaign.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on a duplicate id or an empty window.
    pub fn add_campaign(&mut self, campaign: Campaign) -> EngineResult<()> {
        if campaign.starts_at >= campaign.ends_at {
            return Err(EngineError::InvalidConfig(format!(
                "campaign {} window is empty",
                campaign.id
            )));
        }
        if self.campaigns.contains_key(&campaign.id) {
            return Err(EngineError::InvalidConfig(format!(
                "duplicate campaign id {}",
                campaign.id
            )));
        }
        self.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    /// Adds an item to an existing campaign.
    ///
    /// # Errors
    ///
    /// `CampaignNotFound` or `InvalidConfig` on a duplicate id.
    pub fn add_item(&mut self, item: Item) -> EngineResult<()> {
        if !self.campaigns.contains_key(&item.campaign_id) {
            return Err(EngineError::CampaignNotFound(item.campaign_id));
        }
        if self.items.contains_key(&item.id) {
            return Err(EngineError::InvalidConfig(format!(
                "duplicate item id {}",
                item.id
            )));
        }
        self.items.insert(item.id, item);
        Ok(())
    }

    /// Adds a privilege whose requirements are items of its own campaign.
    ///
    /// # Errors
    ///
    /// `CampaignNotFound`, `ItemNotFound`, or `InvalidConfig` on a duplicate
    /// id, a zero amount, or a requirement from another campaign.
    pub fn add_privilege(&mut self, privilege: Privilege) -> EngineResult<()> {
        if !self.campaigns.contains_key(&privilege.campaign_id) {
            return Err(EngineError::CampaignNotFound(privilege.campaign_id));
        }
        if self.privileges.contains_key(&privilege.id) {
            return Err(EngineError::InvalidConfig(format!(
                "duplicate privilege id {}",
                privilege.id
            )));
        }
        for entry in &privilege.requirements {
            let item = self
                .items
                .get(&entry.item_id)
                .ok_or(EngineError::ItemNotFound(entry.item_id))?;
            if item.campaign_id != privilege.campaign_id {
                return Err(EngineError::InvalidConfig(format!(
                    "privilege {} requires item {} from campaign {}",
                    privilege.id, item.id, item.campaign_id
                )));
            }
            if entry.amount == 0 {
                return Err(EngineError::InvalidConfig(format!(
                    "privilege {} requires zero of item {}",
                    privilege.id, item.id
                )));
            }
        }
        self.privileges.insert(privilege.id, privilege);
        Ok(())
    }

    /// Adds `user_id` to the block list of `issuer_id`.
    pub fn block_user(&mut self, issuer_id: IssuerId, user_id: UserId) {
        self.blocked.insert((issuer_id, user_id));
    }

    /// Removes `user_id` from the block list of `issuer_id`.
    pub fn unblock_user(&mut self, issuer_id: IssuerId, user_id: UserId) {
        self.blocked.remove(&(issuer_id, user_id));
    }
}

impl Catalog for StaticCatalog {
    fn campaign(&self, campaign_id: CampaignId) -> Option<Campaign> {
        self.campaigns.get(&campaign_id).cloned()
    }

    fn items_in_campaign(&self, campaign_id: CampaignId) -> Vec<Item> {
        self.items
            .values()
            .filter(|item| item.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    fn privilege(&self, privilege_id: PrivilegeId) -> Option<Privilege> {
        self.privileges.get(&privilege_id).cloned()
    }

    fn is_blocked(&self, issuer_id: IssuerId, user_id: UserId) -> bool {
        self.blocked.contains(&(issuer_id, user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
        [[campaigns]]
        id = 1
        issuer_id = 9
        starts_at = 0
        ends_at = 1000
        emission_rates = { 1 = 60, 2 = 40 }

        [[items]]
        id = 101
        campaign_id = 1
        rarity = 1

        [[items]]
        id = 201
        campaign_id = 1
        rarity = 2

        [[privileges]]
        id = 5
        campaign_id = 1
        expires_at = 1000
        limit_execution_times = 1
        requirements = [{ item_id = 101, amount = 2 }]

        [[block_lists]]
        issuer_id = 9
        users = [13]
    "#;

    #[test]
    fn test_load_from_toml() {
        let catalog = StaticCatalog::from_toml_str(CATALOG).unwrap();
        let campaign = catalog.campaign(1).unwrap();
        assert_eq!(campaign.emission_table.total_weight(), 100.0);
        assert_eq!(catalog.items_in_campaign(1).len(), 2);
        assert!(catalog.items_in_campaign(2).is_empty());
        assert_eq!(catalog.privilege(5).unwrap().requirements.len(), 1);
        assert!(catalog.is_blocked(9, 13));
        assert!(!catalog.is_blocked(9, 14));
        assert!(!catalog.is_blocked(8, 13));
    }

    #[test]
    fn test_non_numeric_weight_rejected() {
        let text = CATALOG.replace("2 = 40", "2 = \"forty\"");
        assert!(matches!(
            StaticCatalog::from_toml_str(&text),
            Err(EngineError::InvalidEmissionTable(_))
        ));
    }

    #[test]
    fn test_non_numeric_tier_rejected() {
        let text = CATALOG.replace("2 = 40", "rare = 40");
        assert!(matches!(
            StaticCatalog::from_toml_str(&text),
            Err(EngineError::InvalidEmissionTable(_))
        ));
    }

    #[test]
    fn test_dangling_references_rejected() {
        let text = CATALOG.replace("item_id = 101", "item_id = 999");
        assert_eq!(
            StaticCatalog::from_toml_str(&text).unwrap_err(),
            EngineError::ItemNotFound(999)
        );

        let mut catalog = StaticCatalog::new();
        let orphan = Item {
            id: 1,
            campaign_id: 42,
            rarity: 1,
        };
        assert_eq!(
            catalog.add_item(orphan),
            Err(EngineError::CampaignNotFound(42))
        );
    }

    #[test]
    fn test_block_and_unblock() {
        let mut catalog = StaticCatalog::new();
        catalog.block_user(1, 2);
        assert!(catalog.is_blocked(1, 2));
        catalog.unblock_user(1, 2);
        assert!(!catalog.is_blocked(1, 2));
    }
}
