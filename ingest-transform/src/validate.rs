use crate::event::{CanonicalEvent, KeyedEvent};

/// Fields that must be present and non-empty for an event to be written to the sink.
pub const REQUIRED_FIELDS: [&str; 4] = ["event_id", "timestamp", "event_type", "source_platform"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Valid,
    /// Lists the required fields that are missing or empty, in schema order.
    Invalid { missing: Vec<&'static str> },
}

impl Classification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Classification::Valid)
    }
}

/// An event that failed validation, on its way to the dead-letter channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidEvent {
    pub event: CanonicalEvent,
    pub missing: Vec<&'static str>,
}

/// Classify an event against the required-field rules. Only the four required
/// fields are inspected, optional fields never change the outcome.
pub fn classify(event: &CanonicalEvent) -> Classification {
    let required = [
        &event.event_id,
        &event.timestamp,
        &event.event_type,
        &event.source_platform,
    ];

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .iter()
        .zip(required)
        .filter(|(_, value)| !is_present(value))
        .map(|(name, _)| *name)
        .collect();

    if missing.is_empty() {
        Classification::Valid
    } else {
        Classification::Invalid { missing }
    }
}

/// Split events into valid and invalid, keeping input order on both sides.
pub fn partition(events: Vec<KeyedEvent>) -> (Vec<KeyedEvent>, Vec<InvalidEvent>) {
    let mut valid = Vec::with_capacity(events.len());
    let mut invalid = Vec::new();

    for keyed in events {
        match classify(&keyed.event) {
            Classification::Valid => valid.push(keyed),
            Classification::Invalid { missing } => invalid.push(InvalidEvent {
                event: keyed.event,
                missing,
            }),
        }
    }

    (valid, invalid)
}

fn is_present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_event() -> CanonicalEvent {
        CanonicalEvent {
            event_id: Some("e1".to_string()),
            timestamp: Some("2025-01-01T00:00:00Z".to_string()),
            event_type: Some("purchase".to_string()),
            source_platform: Some("web".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn complete_event_is_valid() {
        assert_eq!(classify(&valid_event()), Classification::Valid);
    }

    #[test]
    fn missing_or_empty_required_fields_are_reported() {
        let mut event = valid_event();
        event.event_type = None;
        event.source_platform = Some(String::new());

        assert_eq!(
            classify(&event),
            Classification::Invalid {
                missing: vec!["event_type", "source_platform"]
            }
        );

        assert_eq!(
            classify(&CanonicalEvent::default()),
            Classification::Invalid {
                missing: REQUIRED_FIELDS.to_vec()
            }
        );
    }

    #[test]
    fn optional_fields_do_not_affect_validity() {
        let optional_mutations: [fn(&mut CanonicalEvent); 6] = [
            |e| e.user_id = Some("u".to_string()),
            |e| e.user_anonymous_id = Some(String::new()),
            |e| e.marketing_channel = Some("ads".to_string()),
            |e| e.campaign_id = None,
            |e| e.revenue_usd = Some(-1.0),
            |e| e.properties = Some("{}".to_string()),
        ];

        let mut invalid = valid_event();
        invalid.timestamp = None;

        for base in [valid_event(), invalid] {
            let expected = classify(&base);
            for mutate in optional_mutations {
                let mut event = base.clone();
                mutate(&mut event);
                assert_eq!(classify(&event), expected);
            }
        }
    }

    #[test]
    fn partition_keeps_order_and_tokens() {
        let mut broken = valid_event();
        broken.event_id = Some("e2".to_string());
        broken.event_type = None;

        let events = vec![
            KeyedEvent {
                event: valid_event(),
                insert_id: Some("tok".to_string()),
            },
            KeyedEvent {
                event: broken.clone(),
                insert_id: None,
            },
        ];

        let (valid, invalid) = partition(events);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].insert_id.as_deref(), Some("tok"));
        assert_eq!(
            invalid,
            vec![InvalidEvent {
                event: broken,
                missing: vec!["event_type"]
            }]
        );
    }
}
