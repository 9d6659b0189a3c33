// Copyright 2025 Tailwater Contributors
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
//
// SPDX-License-Identifier: Apache-2.0

//! Custom pipeline parsing and variable substitution.
//!
//! Operators can prepend an aggregation fragment, written as an extended JSON
//! array, to the watch and replay pipelines. Before parsing, the fragment may
//! reference the following variables:
//!
//! | variable | value |
//! |---|---|
//! | `%currentTimestamp%` | current unix time in whole seconds, expressed in milliseconds |
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use tailwater_core::variables;
//!
//! let now = || Utc.with_ymd_and_hms(2021, 6, 8, 18, 0, 0).unwrap();
//! let raw = r#"[{"$match":{"createdAt":{"$gt":%currentTimestamp%}}}]"#;
//!
//! assert_eq!(
//!     variables::replace(raw, now),
//!     r#"[{"$match":{"createdAt":{"$gt":1623175200000}}}]"#
//! );
//! ```

use crate::config::ConfigError;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};

/// Placeholder replaced by the current unix time in milliseconds, truncated
/// to the second.
pub const CURRENT_TIMESTAMP: &str = "%currentTimestamp%";

/// Substitutes every known variable in `raw`.
///
/// `now` is only called when a time based variable is present.
pub fn replace<F>(raw: &str, now: F) -> String
where
    F: Fn() -> DateTime<Utc>,
{
    if !raw.contains(CURRENT_TIMESTAMP) {
        return raw.to_string();
    }
    raw.replace(CURRENT_TIMESTAMP, &(now().timestamp() * 1000).to_string())
}

/// Substitutes variables and parses the fragment into pipeline stages.
///
/// An empty (or whitespace only) fragment yields an empty pipeline.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidPipeline`] when the fragment is not an
/// extended JSON array of documents.
pub fn parse_pipeline<F>(raw: &str, now: F) -> Result<Vec<Document>, ConfigError>
where
    F: Fn() -> DateTime<Utc>,
{
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let replaced = replace(raw, now);
    let json: serde_json::Value = serde_json::from_str(&replaced)
        .map_err(|e| ConfigError::InvalidPipeline(e.to_string()))?;

    match Bson::try_from(json).map_err(|e| ConfigError::InvalidPipeline(e.to_string()))? {
        Bson::Array(stages) => stages
            .into_iter()
            .map(|stage| match stage {
                Bson::Document(document) => Ok(document),
                other => Err(ConfigError::InvalidPipeline(format!(
                    "pipeline stage must be a document, got {:?}",
                    other.element_type()
                ))),
            })
            .collect(),
        other => Err(ConfigError::InvalidPipeline(format!(
            "pipeline must be an array, got {:?}",
            other.element_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 6, 8, 18, 0, 0).unwrap()
    }

    #[test]
    fn test_replace_current_timestamp() {
        assert_eq!(
            replace("%currentTimestamp%", fixed_now),
            "1623175200000"
        );
        assert_eq!(
            replace("a %currentTimestamp% b %currentTimestamp%", fixed_now),
            "a 1623175200000 b 1623175200000"
        );
    }

    #[test]
    fn test_replace_truncates_to_whole_seconds() {
        let now = || {
            Utc.with_ymd_and_hms(2021, 6, 8, 18, 0, 0).unwrap()
                + chrono::Duration::milliseconds(987)
        };
        assert_eq!(replace("%currentTimestamp%", now), "1623175200000");
    }

    #[test]
    fn test_replace_without_variables_skips_clock() {
        let raw = r#"[{"$match":{"status":"active"}}]"#;
        let replaced = replace(raw, || panic!("clock must not be read"));
        assert_eq!(replaced, raw);
    }

    #[test]
    fn test_parse_pipeline_with_variables() {
        let raw = r#"[{"$match":{"updatedAt":{"$gte":{"$date":{"$numberLong":"%currentTimestamp%"}}}}}]"#;
        let stages = parse_pipeline(raw, fixed_now).unwrap();

        assert_eq!(
            stages,
            vec![doc! {
                "$match": {
                    "updatedAt": { "$gte": bson::DateTime::from_millis(1_623_175_200_000) }
                }
            }]
        );
    }

    #[test]
    fn test_parse_empty_pipeline() {
        assert!(parse_pipeline("  ", fixed_now).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(matches!(
            parse_pipeline(r#"{"$match":{}}"#, fixed_now),
            Err(ConfigError::InvalidPipeline(_))
        ));
        assert!(matches!(
            parse_pipeline("[1]", fixed_now),
            Err(ConfigError::InvalidPipeline(_))
        ));
    }
}
