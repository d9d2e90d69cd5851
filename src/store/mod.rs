//! Row storage for the three artifact kinds.
//!
//! One store per kind ([`rules::RuleStore`], [`docs::DocStore`],
//! [`refs::RefStore`]), each ephemeral over a borrowed connection. Tags and
//! metadata persist as JSON text; timestamps are RFC 3339 UTC. Embeddings
//! live on the rows but are written by the vector index, never here.

pub mod docs;
pub mod refs;
pub mod rules;
pub mod types;

use crate::error::{Error, Result};

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn new_id(explicit: Option<&String>) -> String {
    match explicit {
        Some(id) => id.clone(),
        None => uuid::Uuid::now_v7().to_string(),
    }
}

/// JSON-encode tags, rejecting strings that would break the quoted
/// substring filter used by `find_by_tags`.
pub(crate) fn encode_tags(tags: &[String]) -> Result<String> {
    for tag in tags {
        if tag.contains('"') {
            return Err(Error::InvalidTag(tag.clone()));
        }
    }
    Ok(serde_json::to_string(tags)?)
}

pub(crate) fn decode_tags(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

pub(crate) fn encode_metadata(metadata: Option<&serde_json::Value>) -> Result<Option<String>> {
    Ok(metadata.map(serde_json::to_string).transpose()?)
}

pub(crate) fn decode_metadata(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

pub(crate) fn validate_tier(tier: u8) -> Result<()> {
    if (1..=5).contains(&tier) {
        Ok(())
    } else {
        Err(Error::InvalidTier(tier))
    }
}

pub(crate) fn decode_embedding(blob: Option<Vec<u8>>) -> Option<Vec<f32>> {
    blob.and_then(|bytes| crate::vector::deserialize_embedding(&bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip() {
        let tags = vec!["sec".to_string(), "validate".to_string()];
        let encoded = encode_tags(&tags).unwrap();
        assert_eq!(encoded, r#"["sec","validate"]"#);
        assert_eq!(decode_tags(&encoded), tags);
    }

    #[test]
    fn empty_tags_encode_as_empty_array() {
        assert_eq!(encode_tags(&[]).unwrap(), "[]");
        assert!(decode_tags("[]").is_empty());
    }

    #[test]
    fn quoted_tag_rejected() {
        let err = encode_tags(&[r#"bad"tag"#.to_string()]).unwrap_err();
        assert!(matches!(err, Error::InvalidTag(_)));
    }

    #[test]
    fn tier_bounds() {
        assert!(validate_tier(1).is_ok());
        assert!(validate_tier(5).is_ok());
        assert!(matches!(validate_tier(0), Err(Error::InvalidTier(0))));
        assert!(matches!(validate_tier(6), Err(Error::InvalidTier(6))));
    }

    #[test]
    fn explicit_id_wins_over_generated() {
        let explicit = "r1".to_string();
        assert_eq!(new_id(Some(&explicit)), "r1");
        let generated = new_id(None);
        assert!(!generated.is_empty());
        assert_ne!(generated, new_id(None));
    }

    #[test]
    fn metadata_decode_tolerates_garbage() {
        assert_eq!(decode_metadata(None), None);
        assert_eq!(decode_metadata(Some("not json".into())), None);
        let value = decode_metadata(Some(r#"{"k":1}"#.into())).unwrap();
        assert_eq!(value["k"], 1);
    }
}
