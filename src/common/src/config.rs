// Copyright 2025 FusionFlow Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use crate::error::{FlowError, FlowResult};

/// Parser for the recommended node configuration string format:
/// whitespace-separated `Key=Value` pairs, later keys overwriting earlier
/// ones.
///
/// The framework itself treats node config strings opaquely; this parser
/// is a convenience for node implementations that opt into the format.
#[derive(Debug, Clone, Default)]
pub struct ConfigStringParser {
    entries: BTreeMap<String, String>,
}

impl ConfigStringParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `config`, merging its pairs over any previously parsed ones.
    /// Tokens without a `=` are rejected.
    pub fn parse(&mut self, config: &str) -> FlowResult<()> {
        for token in config.split_whitespace() {
            let (key, value) = token.split_once('=').ok_or_else(|| {
                FlowError::InvalidConfiguration(
                    format!("expected Key=Value, got `{token}`").into_boxed_str(),
                )
            })?;
            if key.is_empty() {
                return Err(FlowError::InvalidConfiguration(
                    format!("empty key in `{token}`").into_boxed_str(),
                ));
            }
            self.entries.insert(key.to_owned(), value.to_owned());
        }
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_u64(&self, key: &str) -> FlowResult<Option<u64>> {
        self.get_parsed(key)
    }

    pub fn get_i64(&self, key: &str) -> FlowResult<Option<i64>> {
        self.get_parsed(key)
    }

    pub fn get_f64(&self, key: &str) -> FlowResult<Option<f64>> {
        self.get_parsed(key)
    }

    pub fn get_bool(&self, key: &str) -> FlowResult<Option<bool>> {
        self.get_parsed(key)
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> FlowResult<Option<T>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                FlowError::InvalidConfiguration(
                    format!("key `{key}` has unparsable value `{raw}`").into_boxed_str(),
                )
            }),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Render back to the `Key=Value` form, keys in sorted order.
    pub fn to_config_string(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typed_values() {
        let mut parser = ConfigStringParser::new();
        parser
            .parse("Threads=4 Scale=0.5 Model=yolov5 Enabled=true")
            .unwrap();

        assert_eq!(parser.get_u64("Threads").unwrap(), Some(4));
        assert_eq!(parser.get_f64("Scale").unwrap(), Some(0.5));
        assert_eq!(parser.get_str("Model"), Some("yolov5"));
        assert_eq!(parser.get_bool("Enabled").unwrap(), Some(true));
        assert_eq!(parser.get_str("Missing"), None);
    }

    #[test]
    fn test_later_keys_overwrite() {
        let mut parser = ConfigStringParser::new();
        parser.parse("Interval=10").unwrap();
        parser.parse("Interval=25 Extra=x").unwrap();
        assert_eq!(parser.get_u64("Interval").unwrap(), Some(25));
        assert!(parser.contains("Extra"));
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let mut parser = ConfigStringParser::new();
        assert!(parser.parse("NoEquals").is_err());
        assert!(parser.parse("=value").is_err());
        // Wrong value type surfaces as invalid configuration.
        parser.parse("Threads=four").unwrap();
        assert!(parser.get_u64("Threads").is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut parser = ConfigStringParser::new();
        parser.parse("B=2 A=1").unwrap();
        assert_eq!(parser.to_config_string(), "A=1 B=2");
    }
}
