//! Per-kind content validator registry: a table of `(kind, validator_fn)`
//! pairs rather than a switch. Absent mapping means "no extra rules".

use std::collections::HashMap;

use crate::model::Event;

pub type ContentValidatorFn = fn(&Event) -> Result<(), String>;

pub struct ValidatorRegistry {
    validators: HashMap<u32, ContentValidatorFn>,
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        let mut validators: HashMap<u32, ContentValidatorFn> = HashMap::new();
        validators.insert(0, validate_metadata);
        validators.insert(3, validate_contact_list);
        validators.insert(1984, validate_report);
        Self { validators }
    }
}

impl ValidatorRegistry {
    pub fn register(&mut self, kind: u32, f: ContentValidatorFn) {
        self.validators.insert(kind, f);
    }

    pub fn validate(&self, event: &Event) -> Result<(), String> {
        match self.validators.get(&event.kind) {
            Some(f) => f(event),
            None => Ok(()),
        }
    }
}

fn validate_metadata(event: &Event) -> Result<(), String> {
    if event.content.is_empty() {
        return Ok(());
    }
    let value: serde_json::Value =
        serde_json::from_str(&event.content).map_err(|_| "content must be a JSON object".to_string())?;
    if !value.is_object() {
        return Err("metadata content must be a JSON object".to_string());
    }
    Ok(())
}

fn validate_contact_list(event: &Event) -> Result<(), String> {
    for tag in &event.tags {
        if tag.first().map(|s| s.as_str()) == Some("p") {
            let pubkey = tag.get(1).ok_or("p tag missing pubkey")?;
            if !crate::model::is_valid_hex(pubkey, 64) {
                return Err("p tag pubkey must be 64-hex".to_string());
            }
        }
    }
    Ok(())
}

fn validate_report(event: &Event) -> Result<(), String> {
    let has_subject = event.tags.iter().any(|t| {
        matches!(t.first().map(|s| s.as_str()), Some("e") | Some("p"))
    });
    if !has_subject {
        return Err("report must reference an event or pubkey".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u32, content: &str, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "0".repeat(64),
            pubkey: "a".repeat(64),
            created_at: 1,
            kind,
            tags,
            content: content.to_string(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn metadata_requires_json_object() {
        let reg = ValidatorRegistry::default();
        assert!(reg.validate(&event(0, "{}", vec![])).is_ok());
        assert!(reg.validate(&event(0, "not json", vec![])).is_err());
        assert!(reg.validate(&event(0, "[1,2]", vec![])).is_err());
    }

    #[test]
    fn unregistered_kind_passes() {
        let reg = ValidatorRegistry::default();
        assert!(reg.validate(&event(9999, "anything", vec![])).is_ok());
    }
}
