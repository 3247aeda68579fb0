//! In-memory ad platform used by the demo binary and by tests.
//!
//! Holds an account → campaign → ad tree per owner, per-ad counters that
//! grow with simulated delivery time, and a failure-injection table keyed
//! by operation and target id.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use adrules_core::error::PlatformError;
use adrules_core::types::{
    AccountId, AccountNode, AdId, AdMetrics, AdNode, AdRef, AdSnapshot, AdStatus, CampaignId,
    CampaignNode, Inventory, UserId,
};

use crate::collaborators::{AdController, InventorySource, MetricsProvider};

/// Operations that can be slowed down or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Inventory,
    Metrics,
    Stop,
    Resume,
}

/// Delivery pace applied by [`SimulatedPlatform::advance_delivery`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdPace {
    pub spend_per_hour: f64,
    pub impressions_per_hour: f64,
    pub clicks_per_hour: f64,
    pub leads_per_hour: f64,
}

struct SimAccount {
    owner: UserId,
    name: String,
}

struct SimCampaign {
    account_id: AccountId,
    name: String,
}

struct SimAd {
    ad_ref: AdRef,
    name: String,
    status: AdStatus,
    metrics: Option<AdMetrics>,
    pace: AdPace,
    // fractional counts carried between delivery ticks: impressions, clicks, leads
    carry: [f64; 3],
}

enum Injected {
    Once(VecDeque<PlatformError>),
    Always(PlatformError),
}

#[derive(Default)]
pub struct SimulatedPlatform {
    accounts: DashMap<AccountId, SimAccount>,
    campaigns: DashMap<CampaignId, SimCampaign>,
    ads: DashMap<AdId, SimAd>,
    failures: Mutex<HashMap<(SimOp, String), Injected>>,
    latency_ms: DashMap<SimOp, u64>,
    stop_calls: AtomicU64,
    resume_calls: AtomicU64,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, owner: &str, account_id: &str, name: &str) {
        self.accounts.insert(
            account_id.to_string(),
            SimAccount {
                owner: owner.to_string(),
                name: name.to_string(),
            },
        );
    }

    pub fn add_campaign(&self, account_id: &str, campaign_id: &str, name: &str) {
        self.campaigns.insert(
            campaign_id.to_string(),
            SimCampaign {
                account_id: account_id.to_string(),
                name: name.to_string(),
            },
        );
    }

    /// Adds an active ad with the given counters. Returns `None` when the
    /// campaign is unknown.
    pub fn add_ad(&self, campaign_id: &str, ad_id: &str, name: &str, metrics: AdMetrics) -> Option<AdRef> {
        let account_id = self.campaigns.get(campaign_id)?.account_id.clone();
        let ad_ref = AdRef {
            account_id,
            campaign_id: campaign_id.to_string(),
            ad_id: ad_id.to_string(),
        };
        self.ads.insert(
            ad_id.to_string(),
            SimAd {
                ad_ref: ad_ref.clone(),
                name: name.to_string(),
                status: AdStatus::Active,
                metrics: Some(metrics),
                pace: AdPace::default(),
                carry: [0.0; 3],
            },
        );
        Some(ad_ref)
    }

    pub fn ad_ref(&self, ad_id: &str) -> Option<AdRef> {
        self.ads.get(ad_id).map(|ad| ad.ad_ref.clone())
    }

    pub fn set_metrics(&self, ad_id: &str, metrics: AdMetrics) {
        if let Some(mut ad) = self.ads.get_mut(ad_id) {
            ad.metrics = Some(metrics);
        }
    }

    /// The platform has no statistics for the ad yet.
    pub fn clear_metrics(&self, ad_id: &str) {
        if let Some(mut ad) = self.ads.get_mut(ad_id) {
            ad.metrics = None;
        }
    }

    pub fn metrics(&self, ad_id: &str) -> Option<AdMetrics> {
        self.ads.get(ad_id).and_then(|ad| ad.metrics)
    }

    pub fn set_pace(&self, ad_id: &str, pace: AdPace) {
        if let Some(mut ad) = self.ads.get_mut(ad_id) {
            ad.pace = pace;
        }
    }

    /// Changes status directly, as if the user did it in the platform UI.
    pub fn set_status(&self, ad_id: &str, status: AdStatus) {
        if let Some(mut ad) = self.ads.get_mut(ad_id) {
            ad.status = status;
        }
    }

    pub fn status(&self, ad_id: &str) -> Option<AdStatus> {
        self.ads.get(ad_id).map(|ad| ad.status)
    }

    pub fn remove_ad(&self, ad_id: &str) {
        self.ads.remove(ad_id);
    }

    /// Disconnects an account together with its campaigns and ads.
    pub fn remove_account(&self, account_id: &str) {
        self.accounts.remove(account_id);
        self.campaigns.retain(|_, c| c.account_id != account_id);
        self.ads.retain(|_, ad| ad.ad_ref.account_id != account_id);
    }

    /// Queues a one-shot failure for `op` on `target` (an ad id, or the user
    /// id for inventory calls).
    pub fn fail_next(&self, op: SimOp, target: &str, err: PlatformError) {
        let mut failures = self.failures.lock();
        match failures
            .entry((op, target.to_string()))
            .or_insert_with(|| Injected::Once(VecDeque::new()))
        {
            Injected::Once(queue) => queue.push_back(err),
            slot => *slot = Injected::Once(VecDeque::from([err])),
        }
    }

    /// Every call of `op` on `target` fails until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: SimOp, target: &str, err: PlatformError) {
        self.failures
            .lock()
            .insert((op, target.to_string()), Injected::Always(err));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn set_latency(&self, op: SimOp, latency: Duration) {
        self.latency_ms.insert(op, latency.as_millis() as u64);
    }

    pub fn stop_calls(&self) -> u64 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> u64 {
        self.resume_calls.load(Ordering::SeqCst)
    }

    /// Accrues `hours` of delivery on every active ad at its configured pace.
    pub fn advance_delivery(&self, hours: f64) {
        if !(hours > 0.0) {
            return;
        }
        for mut ad in self.ads.iter_mut() {
            if !ad.status.is_delivering() {
                continue;
            }
            let pace = ad.pace;
            let mut carry = ad.carry;
            let mut take = |slot: usize, per_hour: f64| -> u64 {
                carry[slot] += per_hour * hours;
                let whole = carry[slot].floor();
                carry[slot] -= whole;
                whole as u64
            };
            let impressions = take(0, pace.impressions_per_hour);
            let clicks = take(1, pace.clicks_per_hour);
            let leads = take(2, pace.leads_per_hour);
            ad.carry = carry;

            let metrics = ad.metrics.get_or_insert_with(AdMetrics::default);
            let spent = pace.spend_per_hour * hours;
            metrics.spend += spent;
            metrics.daily_spend += spent;
            metrics.impressions += impressions;
            metrics.clicks += clicks;
            metrics.leads += leads;
            metrics.active_hours += hours;
        }
    }

    /// Seeds one account with a mix of healthy and under-performing ads.
    pub fn seed_demo(&self, owner: &str) {
        self.add_account(owner, "demo-acc-1", "Demo agency account");
        self.add_campaign("demo-acc-1", "demo-camp-leads", "Lead generation");
        self.add_campaign("demo-acc-1", "demo-camp-reach", "Brand reach");

        let seeds: [(&str, &str, &str, AdMetrics, AdPace); 4] = [
            (
                "demo-camp-leads",
                "demo-ad-expensive",
                "Spring offer, wide audience",
                AdMetrics {
                    spend: 6000.0,
                    leads: 10,
                    clicks: 240,
                    impressions: 30_000,
                    daily_spend: 1500.0,
                    active_hours: 12.0,
                },
                AdPace {
                    spend_per_hour: 500.0,
                    impressions_per_hour: 2500.0,
                    clicks_per_hour: 20.0,
                    leads_per_hour: 0.5,
                },
            ),
            (
                "demo-camp-leads",
                "demo-ad-healthy",
                "Spring offer, lookalike",
                AdMetrics {
                    spend: 3000.0,
                    leads: 30,
                    clicks: 450,
                    impressions: 25_000,
                    daily_spend: 800.0,
                    active_hours: 12.0,
                },
                AdPace {
                    spend_per_hour: 250.0,
                    impressions_per_hour: 2000.0,
                    clicks_per_hour: 35.0,
                    leads_per_hour: 2.5,
                },
            ),
            (
                "demo-camp-leads",
                "demo-ad-no-leads",
                "Catalog carousel",
                AdMetrics {
                    spend: 2200.0,
                    leads: 0,
                    clicks: 90,
                    impressions: 12_000,
                    daily_spend: 600.0,
                    active_hours: 10.0,
                },
                AdPace {
                    spend_per_hour: 220.0,
                    impressions_per_hour: 1200.0,
                    clicks_per_hour: 9.0,
                    leads_per_hour: 0.0,
                },
            ),
            (
                "demo-camp-reach",
                "demo-ad-low-ctr",
                "Video teaser",
                AdMetrics {
                    spend: 900.0,
                    leads: 1,
                    clicks: 15,
                    impressions: 40_000,
                    daily_spend: 300.0,
                    active_hours: 8.0,
                },
                AdPace {
                    spend_per_hour: 110.0,
                    impressions_per_hour: 5000.0,
                    clicks_per_hour: 2.0,
                    leads_per_hour: 0.0,
                },
            ),
        ];

        for (campaign_id, ad_id, name, metrics, pace) in seeds {
            if self.add_ad(campaign_id, ad_id, name, metrics).is_some() {
                self.set_pace(ad_id, pace);
            }
        }
    }

    async fn gate(&self, op: SimOp, target: &str) -> Result<(), PlatformError> {
        let latency = self.latency_ms.get(&op).map(|l| *l.value()).unwrap_or(0);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let mut failures = self.failures.lock();
        let key = (op, target.to_string());
        let injected = match failures.get_mut(&key) {
            Some(Injected::Always(err)) => Some(err.clone()),
            Some(Injected::Once(queue)) => {
                let err = queue.pop_front();
                if queue.is_empty() {
                    failures.remove(&key);
                }
                err
            }
            None => None,
        };
        match injected {
            Some(err) => {
                debug!(?op, target, error = %err, "Injected platform failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InventorySource for SimulatedPlatform {
    async fn inventory(&self, user_id: &str) -> Result<Inventory, PlatformError> {
        self.gate(SimOp::Inventory, user_id).await?;

        let mut account_ids: Vec<(AccountId, String)> = self
            .accounts
            .iter()
            .filter(|a| a.owner == user_id)
            .map(|a| (a.key().clone(), a.name.clone()))
            .collect();
        account_ids.sort();

        let accounts = account_ids
            .into_iter()
            .map(|(account_id, account_name)| {
                let mut campaigns: Vec<CampaignNode> = self
                    .campaigns
                    .iter()
                    .filter(|c| c.account_id == account_id)
                    .map(|c| CampaignNode {
                        id: c.key().clone(),
                        name: c.name.clone(),
                        ads: Vec::new(),
                    })
                    .collect();
                campaigns.sort_by(|a, b| a.id.cmp(&b.id));
                for campaign in &mut campaigns {
                    let mut ads: Vec<AdNode> = self
                        .ads
                        .iter()
                        .filter(|ad| ad.ad_ref.campaign_id == campaign.id)
                        .map(|ad| AdNode {
                            id: ad.key().clone(),
                            name: ad.name.clone(),
                            status: ad.status,
                        })
                        .collect();
                    ads.sort_by(|a, b| a.id.cmp(&b.id));
                    campaign.ads = ads;
                }
                AccountNode {
                    id: account_id,
                    name: account_name,
                    campaigns,
                }
            })
            .collect();

        Ok(Inventory { accounts })
    }
}

#[async_trait]
impl MetricsProvider for SimulatedPlatform {
    async fn get_metrics(&self, ad: &AdRef) -> Result<Option<AdSnapshot>, PlatformError> {
        self.gate(SimOp::Metrics, &ad.ad_id).await?;
        let sim = self
            .ads
            .get(&ad.ad_id)
            .ok_or_else(|| PlatformError::NotFound(format!("ad {}", ad.ad_id)))?;
        Ok(sim.metrics.map(|metrics| AdSnapshot {
            ad_name: sim.name.clone(),
            status: sim.status,
            metrics,
        }))
    }
}

#[async_trait]
impl AdController for SimulatedPlatform {
    async fn stop(&self, ad_id: &str) -> Result<(), PlatformError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.gate(SimOp::Stop, ad_id).await?;
        let mut ad = self
            .ads
            .get_mut(ad_id)
            .ok_or_else(|| PlatformError::NotFound(format!("ad {ad_id}")))?;
        if ad.status == AdStatus::Archived {
            return Err(PlatformError::Api {
                code: 400,
                message: format!("ad {ad_id} is archived"),
            });
        }
        ad.status = AdStatus::Paused;
        Ok(())
    }

    async fn resume(&self, ad_id: &str) -> Result<(), PlatformError> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.gate(SimOp::Resume, ad_id).await?;
        let mut ad = self
            .ads
            .get_mut(ad_id)
            .ok_or_else(|| PlatformError::NotFound(format!("ad {ad_id}")))?;
        if ad.status == AdStatus::Archived {
            return Err(PlatformError::Api {
                code: 400,
                message: format!("ad {ad_id} is archived"),
            });
        }
        ad.status = AdStatus::Active;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> SimulatedPlatform {
        let p = SimulatedPlatform::new();
        p.add_account("u1", "A", "Account A");
        p.add_campaign("A", "C1", "Campaign 1");
        p.add_ad("C1", "ad-1", "First", AdMetrics::default()).unwrap();
        p.add_ad("C1", "ad-2", "Second", AdMetrics::default()).unwrap();
        p.add_account("u2", "B", "Account B");
        p
    }

    #[tokio::test]
    async fn test_inventory_is_per_owner_and_sorted() {
        let p = platform();
        let inv = p.inventory("u1").await.unwrap();
        assert_eq!(inv.accounts.len(), 1);
        assert_eq!(inv.ad_count(), 2);
        let ads: Vec<_> = inv.accounts[0].campaigns[0].ads.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ads, vec!["ad-1", "ad-2"]);
        assert_eq!(p.inventory("u2").await.unwrap().ad_count(), 0);
        assert!(p.inventory("nobody").await.unwrap().accounts.is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_resume_change_status() {
        let p = platform();
        p.stop("ad-1").await.unwrap();
        assert_eq!(p.status("ad-1"), Some(AdStatus::Paused));
        p.resume("ad-1").await.unwrap();
        assert_eq!(p.status("ad-1"), Some(AdStatus::Active));
        assert_eq!(p.stop_calls(), 1);
        assert_eq!(p.resume_calls(), 1);
        assert!(matches!(p.stop("missing").await, Err(PlatformError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let p = platform();
        p.fail_next(SimOp::Stop, "ad-1", PlatformError::Unauthorized);
        assert_eq!(p.stop("ad-1").await, Err(PlatformError::Unauthorized));
        assert!(p.stop("ad-1").await.is_ok());

        let ad = p.ad_ref("ad-2").unwrap();
        p.fail_always(SimOp::Metrics, "ad-2", PlatformError::Transport("down".into()));
        assert!(p.get_metrics(&ad).await.is_err());
        assert!(p.get_metrics(&ad).await.is_err());
        p.clear_failures();
        assert!(p.get_metrics(&ad).await.unwrap().is_some());
    }

    #[test]
    fn test_advance_delivery_only_for_active_ads() {
        let p = platform();
        let pace = AdPace {
            spend_per_hour: 100.0,
            impressions_per_hour: 1000.0,
            clicks_per_hour: 10.0,
            leads_per_hour: 0.5,
        };
        p.set_pace("ad-1", pace);
        p.set_pace("ad-2", pace);
        p.set_status("ad-2", AdStatus::Paused);

        p.advance_delivery(1.0);
        p.advance_delivery(1.0);

        let m = p.metrics("ad-1").unwrap();
        assert_eq!(m.spend, 200.0);
        assert_eq!(m.impressions, 2000);
        assert_eq!(m.leads, 1);
        assert_eq!(m.active_hours, 2.0);
        assert_eq!(p.metrics("ad-2").unwrap().spend, 0.0);
    }

    #[tokio::test]
    async fn test_remove_account_drops_tree() {
        let p = platform();
        p.remove_account("A");
        assert!(p.inventory("u1").await.unwrap().accounts.is_empty());
        assert!(p.ad_ref("ad-1").is_none());
    }

    #[tokio::test]
    async fn test_seed_demo() {
        let p = SimulatedPlatform::new();
        p.seed_demo("demo");
        let inv = p.inventory("demo").await.unwrap();
        assert_eq!(inv.ad_count(), 4);
        let snapshot = p
            .get_metrics(&p.ad_ref("demo-ad-expensive").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.metrics.cpl(), Some(600.0));
    }
}
