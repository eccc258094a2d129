//! Location and accelerator catalog
//!
//! Read-only lookup of where the requested accelerator is available. Results
//! are not cached: stock changes between query and submission, and the
//! provisioner surfaces that as a rejection.

use crate::error::{OrchestratorError, Result};
use crate::provider::GpuMarketplace;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// One accelerator offering at a location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuOffer {
    /// Provider model identifier (used in creation requests)
    pub model: String,

    /// Display name, when the provider has one
    pub display_name: Option<String>,

    /// Maximum count that can currently be requested
    pub max_count: u32,

    /// Hourly price (USD) per accelerator
    pub price_per_hour: Option<f64>,

    /// Whether instances here can use port forwarding instead of a dedicated IP
    pub port_forwarding: bool,
}

impl GpuOffer {
    /// Case-insensitive substring match on model id or display name
    pub fn matches(&self, pattern: &str) -> bool {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return true;
        }
        self.model.to_lowercase().contains(&pattern)
            || self
                .display_name
                .as_deref()
                .is_some_and(|n| n.to_lowercase().contains(&pattern))
    }

    /// Whether any unit can be requested right now
    pub fn is_available(&self) -> bool {
        self.max_count > 0
    }
}

/// A provider location (data center / host group)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Provider identifier
    pub id: String,

    /// Human-readable name, e.g. "Chubbuck, United States"
    pub name: String,

    /// Accelerators offered here
    pub gpus: Vec<GpuOffer>,
}

impl Location {
    /// First available offer matching `pattern`, honouring the port-forwarding requirement
    pub fn matching_offer(&self, pattern: &str, require_port_forwarding: bool) -> Option<&GpuOffer> {
        self.gpus.iter().find(|g| {
            g.is_available()
                && g.matches(pattern)
                && (!require_port_forwarding || g.port_forwarding)
        })
    }

    /// Available offers, for display
    pub fn available_offers(&self) -> impl Iterator<Item = &GpuOffer> {
        self.gpus.iter().filter(|g| g.is_available())
    }
}

/// Keep locations that offer a matching accelerator, in provider order.
pub fn filter_candidates(
    locations: Vec<Location>,
    pattern: &str,
    require_port_forwarding: bool,
) -> Vec<Location> {
    locations
        .into_iter()
        .filter(|l| l.matching_offer(pattern, require_port_forwarding).is_some())
        .collect()
}

/// Queries the provider for candidate locations
pub struct ResourceCatalog {
    provider: Arc<dyn GpuMarketplace>,
}

impl ResourceCatalog {
    /// Create a catalog over a provider
    pub fn new(provider: Arc<dyn GpuMarketplace>) -> Self {
        Self { provider }
    }

    /// All locations, unfiltered
    pub async fn locations(&self) -> Result<Vec<Location>> {
        self.provider
            .list_locations()
            .await
            .map_err(|e| OrchestratorError::CatalogUnavailable {
                reason: e.to_string(),
            })
    }

    /// Locations offering an accelerator matching `pattern` with stock > 0.
    ///
    /// One read request, no re-ranking. Failure is `CatalogUnavailable`,
    /// which is fatal to the deploy attempt.
    pub async fn find_candidates(
        &self,
        pattern: &str,
        require_port_forwarding: bool,
    ) -> Result<Vec<Location>> {
        info!(
            pattern = %pattern,
            require_port_forwarding,
            "Looking up locations"
        );

        let locations = self.locations().await?;
        let total = locations.len();
        let candidates = filter_candidates(locations, pattern, require_port_forwarding);

        debug!(total, candidates = candidates.len(), "Filtered locations");
        for location in &candidates {
            if let Some(offer) = location.matching_offer(pattern, require_port_forwarding) {
                info!(
                    location = %location.name,
                    location_id = %location.id,
                    gpu = %offer.model,
                    max_count = offer.max_count,
                    price_per_hour = ?offer.price_per_hour,
                    "Candidate location"
                );
            }
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockMarketplace, location, offer};

    fn scenario_locations() -> Vec<Location> {
        vec![
            location("loc-a", "Chubbuck, United States", vec![offer("RTX 4090", 3, true)]),
            location("loc-b", "Orlando, United States", vec![offer("RTX 3090", 5, false)]),
        ]
    }

    #[test]
    fn test_offer_matching_is_case_insensitive_substring() {
        let mut gpu = offer("geforcertx4090-pcie-24gb", 2, true);
        assert!(gpu.matches("4090"));
        assert!(gpu.matches("RTX4090"));
        assert!(!gpu.matches("3090"));

        gpu.display_name = Some("NVIDIA GeForce RTX 4090".to_string());
        assert!(gpu.matches("rtx 4090"));
    }

    #[test]
    fn test_filter_skips_sold_out_and_no_forwarding() {
        let locations = vec![
            location("sold-out", "A", vec![offer("RTX 4090", 0, true)]),
            location("no-pf", "B", vec![offer("RTX 4090", 2, false)]),
            location("ok", "C", vec![offer("RTX 4090", 1, true)]),
        ];

        let strict = filter_candidates(locations.clone(), "4090", true);
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].id, "ok");

        let relaxed = filter_candidates(locations, "4090", false);
        let ids: Vec<_> = relaxed.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["no-pf", "ok"]);
    }

    #[test]
    fn test_filter_keeps_provider_order() {
        let locations = vec![
            location("z", "Z", vec![offer("RTX 4090", 1, true)]),
            location("a", "A", vec![offer("RTX 4090", 8, true)]),
        ];
        let ids: Vec<_> = filter_candidates(locations, "4090", true)
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ids, vec!["z", "a"]);
    }

    #[tokio::test]
    async fn test_find_candidates_scenario() {
        let provider = Arc::new(MockMarketplace::new().with_locations(scenario_locations()));
        let catalog = ResourceCatalog::new(provider.clone());

        let candidates = catalog.find_candidates("4090", true).await.unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "loc-a");
        assert_eq!(provider.location_queries(), 1);
    }

    #[tokio::test]
    async fn test_find_candidates_failure_is_catalog_unavailable() {
        let provider = Arc::new(MockMarketplace::new().fail_locations(503, "maintenance"));
        let catalog = ResourceCatalog::new(provider.clone());

        let err = catalog.find_candidates("4090", true).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::CatalogUnavailable { .. }));
        assert_eq!(provider.location_queries(), 1);
    }
}
