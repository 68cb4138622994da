//! Market registry: resolves and validates the YES/NO token pair for every
//! configured market, eagerly at startup.
//!
//! The mapping is immutable once built. The `markets on/off` command only
//! toggles the per-market enabled flag.

use std::collections::{BTreeMap, HashMap, HashSet};

use rust_decimal::Decimal;
use thiserror::Error;

use crate::config::{LabelMode, MarketDescriptor};

/// Authoritative token mapping and trading rules for one market.
#[derive(Debug, Clone)]
pub struct MarketMeta {
    pub market_id: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub fee_rate: Option<Decimal>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("market {market_id}: expected exactly two outcome tokens, got {count}")]
    WrongTokenCount { market_id: String, count: usize },
    #[error("market {market_id}: empty token id")]
    EmptyTokenId { market_id: String },
    #[error("market {market_id}: YES and NO resolve to the same token id")]
    DuplicateTokenId { market_id: String },
    #[error("market {market_id}: cannot resolve outcome labels [{labels}]")]
    UnresolvedLabels { market_id: String, labels: String },
    #[error("duplicate market id {market_id}")]
    DuplicateMarket { market_id: String },
    #[error("token id {token_id} appears in more than one market")]
    TokenCollision { token_id: String },
}

fn classify_label(label: &str, mode: LabelMode) -> Option<bool> {
    let label = label.trim().to_lowercase();
    match label.as_str() {
        "yes" => Some(true),
        "no" => Some(false),
        "true" | "y" | "1" if mode == LabelMode::Permissive => Some(true),
        "false" | "n" | "0" if mode == LabelMode::Permissive => Some(false),
        _ => None,
    }
}

/// Immutable market mapping plus the mutable per-market enabled flag.
#[derive(Debug)]
pub struct MarketRegistry {
    markets: BTreeMap<String, MarketMeta>,
    token_to_market: HashMap<String, String>,
    enabled: HashSet<String>,
}

impl MarketRegistry {
    /// Validate descriptors into a registry. All markets start enabled.
    pub fn from_descriptors(
        descriptors: &[MarketDescriptor],
        mode: LabelMode,
    ) -> Result<Self, RegistryError> {
        let mut markets = BTreeMap::new();
        let mut token_to_market = HashMap::new();
        for desc in descriptors {
            let meta = Self::resolve(desc, mode)?;
            for token in [&meta.yes_token_id, &meta.no_token_id] {
                if token_to_market
                    .insert(token.clone(), meta.market_id.clone())
                    .is_some()
                {
                    return Err(RegistryError::TokenCollision {
                        token_id: token.clone(),
                    });
                }
            }
            if markets.insert(meta.market_id.clone(), meta).is_some() {
                return Err(RegistryError::DuplicateMarket {
                    market_id: desc.market_id.clone(),
                });
            }
        }
        let enabled = markets.keys().cloned().collect();
        Ok(Self {
            markets,
            token_to_market,
            enabled,
        })
    }

    fn resolve(desc: &MarketDescriptor, mode: LabelMode) -> Result<MarketMeta, RegistryError> {
        if desc.outcomes.len() != 2 {
            return Err(RegistryError::WrongTokenCount {
                market_id: desc.market_id.clone(),
                count: desc.outcomes.len(),
            });
        }
        let mut yes_token: Option<&str> = None;
        let mut no_token: Option<&str> = None;
        for outcome in &desc.outcomes {
            if outcome.token_id.trim().is_empty() {
                return Err(RegistryError::EmptyTokenId {
                    market_id: desc.market_id.clone(),
                });
            }
            match classify_label(&outcome.label, mode) {
                Some(true) if yes_token.is_none() => yes_token = Some(&outcome.token_id),
                Some(false) if no_token.is_none() => no_token = Some(&outcome.token_id),
                // Second yes-ish or no-ish label, or an unknown one.
                _ => {
                    return Err(RegistryError::UnresolvedLabels {
                        market_id: desc.market_id.clone(),
                        labels: desc
                            .outcomes
                            .iter()
                            .map(|o| o.label.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    })
                }
            }
        }
        let (yes, no) = match (yes_token, no_token) {
            (Some(y), Some(n)) => (y.to_string(), n.to_string()),
            _ => {
                return Err(RegistryError::UnresolvedLabels {
                    market_id: desc.market_id.clone(),
                    labels: desc
                        .outcomes
                        .iter()
                        .map(|o| o.label.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                })
            }
        };
        if yes == no {
            return Err(RegistryError::DuplicateTokenId {
                market_id: desc.market_id.clone(),
            });
        }
        Ok(MarketMeta {
            market_id: desc.market_id.clone(),
            yes_token_id: yes,
            no_token_id: no,
            tick_size: desc.tick_size,
            lot_size: desc.lot_size,
            fee_rate: desc.fee_rate,
        })
    }

    pub fn get(&self, market_id: &str) -> Option<&MarketMeta> {
        self.markets.get(market_id)
    }

    pub fn market_for_token(&self, token_id: &str) -> Option<&str> {
        self.token_to_market.get(token_id).map(|s| s.as_str())
    }

    pub fn is_enabled(&self, market_id: &str) -> bool {
        self.enabled.contains(market_id)
    }

    /// Toggle enabled flags. Unknown ids are returned rather than invented.
    pub fn set_enabled(&mut self, market_ids: &[String], enabled: bool) -> Vec<String> {
        let mut unknown = Vec::new();
        for id in market_ids {
            if !self.markets.contains_key(id) {
                unknown.push(id.clone());
                continue;
            }
            if enabled {
                self.enabled.insert(id.clone());
            } else {
                self.enabled.remove(id);
            }
        }
        unknown
    }

    pub fn markets(&self) -> impl Iterator<Item = &MarketMeta> {
        self.markets.values()
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutcomeToken;
    use rust_decimal_macros::dec;

    fn descriptor(market_id: &str, labels: [(&str, &str); 2]) -> MarketDescriptor {
        MarketDescriptor {
            market_id: market_id.to_string(),
            outcomes: labels
                .iter()
                .map(|(label, token)| OutcomeToken {
                    label: label.to_string(),
                    token_id: token.to_string(),
                })
                .collect(),
            tick_size: dec!(0.001),
            lot_size: dec!(1),
            fee_rate: None,
        }
    }

    #[test]
    fn test_strict_accepts_yes_no_case_insensitive() {
        let reg = MarketRegistry::from_descriptors(
            &[descriptor("m1", [("YES", "a"), ("No", "b")])],
            LabelMode::Strict,
        )
        .unwrap();
        let meta = reg.get("m1").unwrap();
        assert_eq!(meta.yes_token_id, "a");
        assert_eq!(meta.no_token_id, "b");
    }

    #[test]
    fn test_strict_rejects_true_false() {
        let err = MarketRegistry::from_descriptors(
            &[descriptor("m1", [("true", "a"), ("false", "b")])],
            LabelMode::Strict,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::UnresolvedLabels { .. }));
    }

    #[test]
    fn test_permissive_accepts_true_false_and_y_n() {
        let reg = MarketRegistry::from_descriptors(
            &[
                descriptor("m1", [("true", "a"), ("false", "b")]),
                descriptor("m2", [("y", "c"), ("n", "d")]),
                descriptor("m3", [("1", "e"), ("0", "f")]),
            ],
            LabelMode::Permissive,
        )
        .unwrap();
        assert_eq!(reg.get("m1").unwrap().yes_token_id, "a");
        assert_eq!(reg.get("m2").unwrap().no_token_id, "d");
        assert_eq!(reg.get("m3").unwrap().yes_token_id, "e");
    }

    #[test]
    fn test_permissive_rejects_arbitrary_labels() {
        let err = MarketRegistry::from_descriptors(
            &[descriptor("m1", [("up", "a"), ("down", "b")])],
            LabelMode::Permissive,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::UnresolvedLabels { .. }));
    }

    #[test]
    fn test_colliding_labels_rejected() {
        let err = MarketRegistry::from_descriptors(
            &[descriptor("m1", [("yes", "a"), ("yes", "b")])],
            LabelMode::Strict,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::UnresolvedLabels { .. }));
    }

    #[test]
    fn test_wrong_token_count_rejected() {
        let mut desc = descriptor("m1", [("yes", "a"), ("no", "b")]);
        desc.outcomes.pop();
        let err =
            MarketRegistry::from_descriptors(&[desc], LabelMode::Strict).unwrap_err();
        assert!(matches!(err, RegistryError::WrongTokenCount { count: 1, .. }));
    }

    #[test]
    fn test_empty_token_id_rejected() {
        let err = MarketRegistry::from_descriptors(
            &[descriptor("m1", [("yes", ""), ("no", "b")])],
            LabelMode::Strict,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::EmptyTokenId { .. }));
    }

    #[test]
    fn test_same_token_both_sides_rejected() {
        let err = MarketRegistry::from_descriptors(
            &[descriptor("m1", [("yes", "a"), ("no", "a")])],
            LabelMode::Strict,
        )
        .unwrap_err();
        // The token index catches the collision before label resolution can.
        assert!(matches!(
            err,
            RegistryError::DuplicateTokenId { .. } | RegistryError::TokenCollision { .. }
        ));
    }

    #[test]
    fn test_enable_disable_flags() {
        let mut reg = MarketRegistry::from_descriptors(
            &[
                descriptor("m1", [("yes", "a"), ("no", "b")]),
                descriptor("m2", [("yes", "c"), ("no", "d")]),
            ],
            LabelMode::Strict,
        )
        .unwrap();
        assert!(reg.is_enabled("m1"));
        let unknown = reg.set_enabled(&["m1".to_string(), "mX".to_string()], false);
        assert_eq!(unknown, vec!["mX".to_string()]);
        assert!(!reg.is_enabled("m1"));
        assert!(reg.is_enabled("m2"));
        reg.set_enabled(&["m1".to_string()], true);
        assert!(reg.is_enabled("m1"));
    }

    #[test]
    fn test_token_lookup() {
        let reg = MarketRegistry::from_descriptors(
            &[descriptor("m1", [("yes", "a"), ("no", "b")])],
            LabelMode::Strict,
        )
        .unwrap();
        assert_eq!(reg.market_for_token("a"), Some("m1"));
        assert_eq!(reg.market_for_token("zzz"), None);
    }
}
