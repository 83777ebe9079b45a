//! Strategy metadata declared in a source header.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Index entry describing a strategy, parsed from its metadata block.
///
/// The block is the run of leading `;; @key value` comments in a WAT source:
///
/// ```text
/// ;; @name Mean Reversion
/// ;; @market crypto
/// ;; @instrument BTC-USD
/// (module ...)
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoIndexItem {
    /// Strategy id in the external index
    #[serde(default)]
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Execution mode, e.g. "live" or "paper"
    #[serde(default)]
    pub mode: String,

    #[serde(default)]
    pub market: String,

    #[serde(default)]
    pub exchange: String,

    /// Traded instrument
    #[serde(default)]
    pub instrument: String,

    /// Quote asset the instrument is priced in
    #[serde(default)]
    pub counter_asset: String,
}

impl AlgoIndexItem {
    /// Parse the metadata header. Unknown keys are ignored; parsing stops at
    /// the first line that is neither blank nor a comment.
    pub fn parse(source: &str) -> Self {
        let mut item = Self::default();

        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(comment) = line.strip_prefix(";;") else {
                break;
            };
            let Some(entry) = comment.trim().strip_prefix('@') else {
                continue;
            };

            let (key, value) = entry
                .split_once(char::is_whitespace)
                .unwrap_or((entry, ""));
            let value = value.trim().to_string();

            match key {
                "id" => item.id = value,
                "name" => item.name = value,
                "description" => item.description = value,
                "mode" => item.mode = value,
                "market" => item.market = value,
                "exchange" => item.exchange = value,
                "instrument" => item.instrument = value,
                "counterAsset" | "counter_asset" => item.counter_asset = value,
                _ => {}
            }
        }

        item
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Metadata payload handed to the sandbox as `meta`.
    pub fn to_meta(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let source = r#"
;; @name Mean Reversion
;; @description Fades 2-sigma moves
;; plain comment, ignored
;; @market crypto
;; @instrument BTC-USD
;; @counterAsset USDC
;; @colour blue
(module
  ;; @name not part of the header
)"#;

        let item = AlgoIndexItem::parse(source);
        assert_eq!(item.name, "Mean Reversion");
        assert_eq!(item.description, "Fades 2-sigma moves");
        assert_eq!(item.market, "crypto");
        assert_eq!(item.instrument, "BTC-USD");
        assert_eq!(item.counter_asset, "USDC");
        assert!(item.exchange.is_empty());
        assert!(item.id.is_empty());
    }

    #[test]
    fn test_no_header() {
        let item = AlgoIndexItem::parse("(module)");
        assert!(item.is_empty());
    }

    #[test]
    fn test_to_meta_is_camel_case() {
        let item = AlgoIndexItem {
            name: "x".to_string(),
            counter_asset: "USD".to_string(),
            ..Default::default()
        };
        let meta = item.to_meta();
        assert_eq!(meta["name"], "x");
        assert_eq!(meta["counterAsset"], "USD");
    }
}
