//! Configured content-generation providers.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::ProviderId;

/// Static description of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Base URL the generation adapter talks to
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<ProviderId>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            endpoint: None,
            cost_per_1k_tokens: 0.0,
            capabilities: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Ordered provider list. The order is the selection tie-break order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRegistry {
    providers: Vec<ProviderDescriptor>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderDescriptor>) -> DomainResult<Self> {
        if providers.is_empty() {
            return Err(DomainError::validation("at least one provider must be configured"));
        }

        let mut seen = HashSet::new();
        for provider in &providers {
            if !seen.insert(provider.id.clone()) {
                return Err(DomainError::validation(format!(
                    "duplicate provider id: {}",
                    provider.id
                )));
            }
        }

        Ok(Self { providers })
    }

    /// Convenience constructor from bare ids.
    pub fn from_ids<I, S>(ids: I) -> DomainResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ProviderId>,
    {
        Self::new(ids.into_iter().map(ProviderDescriptor::new).collect())
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProviderId> {
        self.providers.iter().map(|p| &p.id)
    }

    pub fn get(&self, id: &ProviderId) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &ProviderId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// First provider in configured order that is not `excluded`.
    pub fn first_except(&self, excluded: Option<&ProviderId>) -> Option<&ProviderId> {
        self.ids().find(|id| Some(*id) != excluded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_duplicate_lists() {
        assert!(ProviderRegistry::from_ids(Vec::<&str>::new()).is_err());
        assert!(ProviderRegistry::from_ids(["alpha", "beta", "alpha"]).is_err());
    }

    #[test]
    fn first_except_skips_the_excluded_provider() {
        let registry = ProviderRegistry::from_ids(["alpha", "beta", "gamma"]).unwrap();
        let alpha = ProviderId::new("alpha");

        assert_eq!(registry.first_except(None), Some(&alpha));
        assert_eq!(
            registry.first_except(Some(&alpha)),
            Some(&ProviderId::new("beta"))
        );
    }
}
