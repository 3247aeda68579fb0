//! Expands a rule's account / campaign / ad selection into concrete ads.
//!
//! Selecting an account covers every ad of every campaign under it, selecting
//! a campaign covers all of its ads, and individual ad selections add the rest.
//! References that no longer exist in the inventory are dropped silently.

use std::collections::HashSet;

use adrules_core::types::{AdRef, Inventory, RuleTargets};

/// Result of expanding a target selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Concrete ads, de-duplicated by ad id, in inventory order.
    pub ads: Vec<AdRef>,
    /// Selected ids that were not found in the inventory.
    pub stale: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TargetResolver;

impl TargetResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, targets: &RuleTargets, inventory: &Inventory) -> Resolution {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut found_accounts: HashSet<&str> = HashSet::new();
        let mut found_campaigns: HashSet<&str> = HashSet::new();
        let mut found_ads: HashSet<&str> = HashSet::new();
        let mut ads = Vec::new();

        for account in &inventory.accounts {
            let account_selected = targets.account_ids.contains(&account.id);
            if account_selected {
                found_accounts.insert(account.id.as_str());
            }

            for campaign in &account.campaigns {
                let campaign_listed = targets.campaign_ids.contains(&campaign.id);
                if campaign_listed {
                    found_campaigns.insert(campaign.id.as_str());
                }
                let campaign_selected = account_selected || campaign_listed;

                for ad in &campaign.ads {
                    let ad_listed = targets.ad_ids.contains(&ad.id);
                    if ad_listed {
                        found_ads.insert(ad.id.as_str());
                    }
                    if (campaign_selected || ad_listed) && seen.insert(ad.id.as_str()) {
                        ads.push(AdRef {
                            account_id: account.id.clone(),
                            campaign_id: campaign.id.clone(),
                            ad_id: ad.id.clone(),
                        });
                    }
                }
            }
        }

        let stale = targets
            .account_ids
            .iter()
            .filter(|id| !found_accounts.contains(id.as_str()))
            .chain(
                targets
                    .campaign_ids
                    .iter()
                    .filter(|id| !found_campaigns.contains(id.as_str())),
            )
            .chain(
                targets
                    .ad_ids
                    .iter()
                    .filter(|id| !found_ads.contains(id.as_str())),
            )
            .cloned()
            .collect();

        Resolution { ads, stale }
    }
}
