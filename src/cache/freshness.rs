use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

use super::key::ResourceKey;
use crate::settings::MaxAgeRuleConfig;

/// Default lifetimes applied to validated responses that carry no explicit
/// freshness of their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultFreshness {
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
}

pub trait FreshnessResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, key: &ResourceKey) -> DefaultFreshness;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoDefaultFreshness;

impl FreshnessResolver for NoDefaultFreshness {
    fn resolve(&self, _key: &ResourceKey) -> DefaultFreshness {
        DefaultFreshness::default()
    }
}

#[derive(Debug)]
struct MaxAgeRule {
    host: Option<Regex>,
    path: Regex,
    freshness: DefaultFreshness,
}

/// First-match list of host/path patterns with default lifetimes.
#[derive(Debug, Default)]
pub struct PathMaxAgeRules {
    rules: Vec<MaxAgeRule>,
}

impl PathMaxAgeRules {
    pub fn new(configs: &[MaxAgeRuleConfig]) -> Result<Self> {
        let mut rules = Vec::with_capacity(configs.len());
        for (idx, config) in configs.iter().enumerate() {
            let host = config
                .host
                .as_deref()
                .map(Regex::new)
                .transpose()
                .with_context(|| format!("invalid host pattern in max_age rule {idx}"))?;
            let path = Regex::new(&config.path)
                .with_context(|| format!("invalid path pattern in max_age rule {idx}"))?;
            rules.push(MaxAgeRule {
                host,
                path,
                freshness: DefaultFreshness {
                    max_age: config.max_age.filter(|v| *v > 0).map(Duration::from_secs),
                    s_maxage: config.s_maxage.filter(|v| *v > 0).map(Duration::from_secs),
                },
            });
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FreshnessResolver for PathMaxAgeRules {
    fn resolve(&self, key: &ResourceKey) -> DefaultFreshness {
        self.rules
            .iter()
            .find(|rule| {
                rule.host.as_ref().is_none_or(|host| host.is_match(&key.host))
                    && rule.path.is_match(&key.path)
            })
            .map(|rule| rule.freshness)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(host: Option<&str>, path: &str, max_age: u64) -> MaxAgeRuleConfig {
        MaxAgeRuleConfig {
            host: host.map(str::to_string),
            path: path.to_string(),
            max_age: Some(max_age),
            s_maxage: None,
        }
    }

    #[test]
    fn first_matching_rule_wins() -> Result<()> {
        let rules = PathMaxAgeRules::new(&[
            rule(Some("^static\\."), "^/img/", 3600),
            rule(None, "^/img/", 60),
        ])?;
        let hit = rules.resolve(&ResourceKey::new("static.example.com", "/img/a.png"));
        assert_eq!(hit.max_age, Some(Duration::from_secs(3600)));
        let fallback = rules.resolve(&ResourceKey::new("www.example.com", "/img/a.png"));
        assert_eq!(fallback.max_age, Some(Duration::from_secs(60)));
        let none = rules.resolve(&ResourceKey::new("www.example.com", "/index.html"));
        assert_eq!(none, DefaultFreshness::default());
        Ok(())
    }

    #[test]
    fn rejects_invalid_patterns() {
        let err = PathMaxAgeRules::new(&[rule(None, "(", 10)]).unwrap_err();
        assert!(err.to_string().contains("max_age rule 0"));
    }

    #[test]
    fn zero_ages_mean_unset() -> Result<()> {
        let rules = PathMaxAgeRules::new(&[rule(None, ".*", 0)])?;
        assert_eq!(
            rules.resolve(&ResourceKey::new("h", "/")),
            DefaultFreshness::default()
        );
        Ok(())
    }
}
