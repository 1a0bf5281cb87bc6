//! Entity feed parsing.
//!
//! A feed is either JSON lines (`{"entity_id": "..", "created_at": ".."}`,
//! optionally with `priority`) or one domain per line. Both styles may be
//! mixed; blank lines and `#` comments are skipped.

use std::path::Path;

use chrono::{DateTime, Utc};

use cartograph_shared::{CartographError, Entity, EntityId, Result};

/// Read and parse a feed file. Plain-domain lines are stamped with `now`.
pub(crate) fn read_feed(path: &Path, now: DateTime<Utc>) -> Result<Vec<Entity>> {
    let content = std::fs::read_to_string(path).map_err(|e| CartographError::io(path, e))?;
    parse_feed(&content, now)
}

pub(crate) fn parse_feed(content: &str, now: DateTime<Utc>) -> Result<Vec<Entity>> {
    let mut entities = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let lineno = index + 1;

        let entity = if line.starts_with('{') {
            let mut entity: Entity = serde_json::from_str(line)
                .map_err(|e| CartographError::parse(format!("feed line {lineno}: {e}")))?;
            // Deserialization bypasses normalization
            entity.entity_id = EntityId::new(entity.entity_id.as_str());
            entity
        } else {
            Entity::new(EntityId::new(line), now)
        };

        if !entity.entity_id.is_valid_domain() {
            return Err(CartographError::validation(format!(
                "feed line {lineno}: '{}' is not a domain name",
                entity.entity_id
            )));
        }
        entities.push(entity);
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn plain_lines_take_the_current_time() {
        let feed = "# weekly import\nExample.co.uk\n\n  sportstop.co.uk  \n";
        let entities = parse_feed(feed, now()).unwrap();
        let ids: Vec<&str> = entities.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["example.co.uk", "sportstop.co.uk"]);
        assert!(entities.iter().all(|e| e.created_at == now() && e.priority == 5));
    }

    #[test]
    fn json_lines_keep_their_fields() {
        let feed = r#"{"entity_id":"Shop.example.com","created_at":"2025-11-02T08:00:00Z","priority":8}
plain.co.uk"#;
        let entities = parse_feed(feed, now()).unwrap();
        assert_eq!(entities[0].entity_id.as_str(), "shop.example.com");
        assert_eq!(
            entities[0].created_at,
            Utc.with_ymd_and_hms(2025, 11, 2, 8, 0, 0).unwrap()
        );
        assert_eq!(entities[0].priority, 8);
        assert_eq!(entities[1].entity_id.as_str(), "plain.co.uk");
    }

    #[test]
    fn bad_lines_name_their_position() {
        let err = parse_feed("good.co.uk\nnot a domain\n", now()).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");

        let err = parse_feed("{\"entity_id\": 3}", now()).unwrap_err();
        assert!(matches!(err, CartographError::Parse { .. }));
    }
}
